//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677) without channel binding.

#[cfg(feature = "scram")]
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
#[cfg(feature = "scram")]
use hmac::{Hmac, Mac};
#[cfg(feature = "scram")]
use rand::RngCore;
#[cfg(feature = "scram")]
use sha2::{Digest, Sha256};

#[cfg(feature = "scram")]
use crate::error::{Result, StreamerError};

#[cfg(feature = "scram")]
type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

#[cfg(feature = "scram")]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    Initial,
    /// client-final sent; keep what is needed to check the server signature
    AwaitingServerFinal {
        server_key: Vec<u8>,
        auth_message: String,
    },
    Done,
}

/// One SCRAM-SHA-256 conversation.
///
/// Drive it with [`ScramSha256::client_first`], [`ScramSha256::client_final`]
/// and [`ScramSha256::verify_server_final`], in that order.
#[cfg(feature = "scram")]
#[derive(Debug, Clone)]
pub struct ScramSha256 {
    nonce: String,
    first_bare: String,
    stage: Stage,
}

#[cfg(feature = "scram")]
impl ScramSha256 {
    pub fn new(username: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(username, &B64.encode(raw))
    }

    pub(crate) fn with_nonce(username: &str, nonce: &str) -> Self {
        let user = username.replace('=', "=3D").replace(',', "=2C");
        Self {
            nonce: nonce.to_string(),
            first_bare: format!("n={user},r={nonce}"),
            stage: Stage::Initial,
        }
    }

    /// client-first-message with the `n,,` GS2 header.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.first_bare)
    }

    pub fn client_final(&mut self, password: &str, server_first: &str) -> Result<String> {
        if self.stage != Stage::Initial {
            return Err(StreamerError::Auth("SCRAM exchange out of order".into()));
        }
        let attrs = ServerFirst::parse(server_first)?;
        if !attrs.nonce.starts_with(&self.nonce) || attrs.nonce.len() == self.nonce.len() {
            return Err(StreamerError::Auth("SCRAM server nonce does not extend ours".into()));
        }
        let salt = B64
            .decode(attrs.salt.as_bytes())
            .map_err(|e| StreamerError::Auth(format!("SCRAM invalid salt: {e}")))?;

        // "biws" = base64("n,,")
        let without_proof = format!("c=biws,r={}", attrs.nonce);
        let auth_message = format!("{},{server_first},{without_proof}", self.first_bare);

        let salted = pbkdf2_sha256(password.as_bytes(), &salt, attrs.iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.stage = Stage::AwaitingServerFinal {
            server_key: hmac(&salted, b"Server Key")?,
            auth_message,
        };
        Ok(format!("{without_proof},p={}", B64.encode(proof)))
    }

    pub fn verify_server_final(&mut self, server_final: &str) -> Result<()> {
        let Stage::AwaitingServerFinal {
            server_key,
            auth_message,
        } = std::mem::replace(&mut self.stage, Stage::Done)
        else {
            return Err(StreamerError::Auth("SCRAM exchange out of order".into()));
        };

        let mut verifier = None;
        for part in server_final.split(',') {
            if let Some(err) = part.strip_prefix("e=") {
                return Err(StreamerError::Auth(format!("SCRAM server error: {err}")));
            }
            if let Some(v) = part.strip_prefix("v=") {
                verifier = Some(v.trim());
            }
        }
        let verifier = verifier
            .ok_or_else(|| StreamerError::Auth("SCRAM server-final has no signature".into()))?;
        let got = B64
            .decode(verifier.as_bytes())
            .map_err(|e| StreamerError::Auth(format!("SCRAM invalid server signature: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&server_key)
            .map_err(|e| StreamerError::Internal(format!("hmac key: {e}")))?;
        mac.update(auth_message.as_bytes());
        // constant-time comparison
        mac.verify_slice(&got)
            .map_err(|_| StreamerError::Auth("SCRAM server signature mismatch".into()))
    }
}

#[cfg(feature = "scram")]
struct ServerFirst {
    nonce: String,
    salt: String,
    iterations: u32,
}

#[cfg(feature = "scram")]
impl ServerFirst {
    fn parse(msg: &str) -> Result<Self> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for part in msg.split(',') {
            match part.split_once('=') {
                Some(("r", v)) => nonce = Some(v.to_string()),
                Some(("s", v)) => salt = Some(v.to_string()),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let missing = |what: &str| StreamerError::Auth(format!("SCRAM server-first missing {what}"));
        Ok(Self {
            nonce: nonce.ok_or_else(|| missing("nonce"))?,
            salt: salt.ok_or_else(|| missing("salt"))?,
            iterations: iterations
                .filter(|i| *i > 0)
                .ok_or_else(|| missing("iteration count"))?,
        })
    }
}

#[cfg(feature = "scram")]
fn hmac(key: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StreamerError::Internal(format!("hmac key: {e}")))?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256 and a single output block.
#[cfg(feature = "scram")]
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &block)?;
    let mut out = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u)?;
        out.iter_mut().zip(u.iter()).for_each(|(o, x)| *o ^= x);
    }
    Ok(out)
}

#[cfg(test)]
#[cfg(feature = "scram")]
mod tests {
    use super::*;

    // RFC 7677 section 3 test vector
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn rfc7677_exchange() {
        let mut s = ScramSha256::with_nonce("user", NONCE);
        assert_eq!(s.client_first(), format!("n,,n=user,r={NONCE}"));
        assert_eq!(s.client_final("pencil", SERVER_FIRST).unwrap(), CLIENT_FINAL);
        s.verify_server_final(SERVER_FINAL).unwrap();
    }

    #[test]
    fn rejects_forged_server_signature() {
        let mut s = ScramSha256::with_nonce("user", NONCE);
        s.client_final("pencil", SERVER_FIRST).unwrap();
        let err = s
            .verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut s = ScramSha256::with_nonce("user", NONCE);
        let err = s
            .client_final("pencil", "r=somebodyElse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn escapes_username_and_orders_steps() {
        let mut s = ScramSha256::with_nonce("a=b,c", "n0nce");
        assert!(s.client_first().contains("n=a=3Db=2Cc,r=n0nce"));
        assert!(s.verify_server_final(SERVER_FINAL).is_err());
    }

    #[test]
    fn server_error_attribute_surfaces() {
        let mut s = ScramSha256::with_nonce("user", NONCE);
        s.client_final("pencil", SERVER_FIRST).unwrap();
        let err = s.verify_server_final("e=invalid-proof").unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(ScramSha256::new("u").client_first(), ScramSha256::new("u").client_first());
    }
}
