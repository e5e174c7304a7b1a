//! Password authentication for source connections.
//!
//! - cleartext (always available)
//! - SCRAM-SHA-256 (feature: `scram`), the server default since PostgreSQL 14
//! - md5 (feature: `md5`), for older `pg_hba.conf` setups

pub mod scram;

#[cfg(feature = "scram")]
pub use scram::ScramSha256;

/// `md5` || md5(md5(password || user) || salt), hex encoded.
#[cfg(feature = "md5")]
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}
