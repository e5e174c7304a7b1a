use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use pg_escape::quote_identifier;
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::{Result, StreamerError};
use crate::lsn::Lsn;
use crate::protocol::framing::{
    BackendMessage, MessageReader, write_copy_data, write_copy_done, write_password_message,
    write_query, write_startup_message, write_terminate,
};
use crate::protocol::messages::{
    ErrorFields, parse_auth_request, parse_data_row, parse_error_response, parse_row_description,
};
use crate::protocol::replication::{StatusUpdate, StreamMessage};
use crate::tls::{self, PgStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Ordinary session, used for catalog reads.
    Regular,
    /// `replication=database`: accepts both SQL and replication commands.
    Replication,
}

/// One row of a simple-query result, in text format.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }

    pub fn get_idx(&self, idx: usize) -> Option<&str> {
        self.values.get(idx)?.as_deref()
    }

    pub fn into_values(self) -> Vec<Option<String>> {
        self.values
    }

    /// Non-null column value, or a protocol error naming the column.
    pub fn require(&self, column: &str) -> Result<&str> {
        self.get(column)
            .ok_or_else(|| StreamerError::Protocol(format!("column {column} missing or null")))
    }
}

/// What to do with the snapshot exported by `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    NoExport,
    /// Install the slot's snapshot in the current (repeatable read) transaction.
    Use,
}

#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlog_pos: Lsn,
}

/// A raw frontend/backend protocol session against a source database.
pub struct PgConnection {
    stream: PgStream,
    reader: MessageReader,
    server_params: HashMap<String, String>,
}

impl PgConnection {
    pub async fn connect(cfg: &SourceConfig, kind: ConnectionKind) -> Result<Self> {
        let stream = tls::connect(cfg).await?;
        let mut conn = PgConnection {
            stream,
            reader: MessageReader::new(),
            server_params: HashMap::new(),
        };

        let mut params = vec![
            ("user", cfg.user.as_str()),
            ("database", cfg.database.as_str()),
            ("client_encoding", "UTF8"),
            ("application_name", cfg.application_name.as_str()),
        ];
        if kind == ConnectionKind::Replication {
            params.push(("replication", "database"));
        }
        write_startup_message(&mut conn.stream, &params).await?;
        conn.authenticate(cfg).await?;
        debug!(
            host = %cfg.host,
            database = %cfg.database,
            tls = conn.stream.is_tls(),
            ?kind,
            "source connection established"
        );
        Ok(conn)
    }

    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    async fn read(&mut self) -> Result<BackendMessage> {
        loop {
            let msg = self.reader.read(&mut self.stream).await?;
            match msg.tag {
                b'S' => self.record_parameter(&msg.payload),
                b'N' => {
                    let notice = ErrorFields::parse(&msg.payload);
                    debug!(notice = %notice, "source notice");
                }
                _ => return Ok(msg),
            }
        }
    }

    fn record_parameter(&mut self, payload: &[u8]) {
        let mut parts = payload.split(|&b| b == 0);
        if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
            self.server_params.insert(
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            );
        }
    }

    async fn authenticate(&mut self, cfg: &SourceConfig) -> Result<()> {
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    match code {
                        0 => {} // AuthenticationOk
                        3 => {
                            let mut p = cfg.password.as_bytes().to_vec();
                            p.push(0);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        10 => {
                            let mechanisms = rest.to_vec();
                            self.auth_sasl(cfg, &mechanisms).await?;
                        }
                        #[cfg(feature = "md5")]
                        5 => {
                            let salt: [u8; 4] = rest.try_into().map_err(|_| {
                                StreamerError::Protocol("md5 auth salt missing".into())
                            })?;
                            let mut p =
                                crate::auth::md5_password(&cfg.user, &cfg.password, &salt)
                                    .into_bytes();
                            p.push(0);
                            write_password_message(&mut self.stream, &p).await?;
                        }
                        _ => {
                            return Err(StreamerError::Auth(format!(
                                "unsupported auth method: {code}"
                            )));
                        }
                    }
                }
                b'E' => return Err(StreamerError::Server(parse_error_response(&msg.payload))),
                b'K' => {}             // BackendKeyData
                b'Z' => return Ok(()), // ReadyForQuery
                _ => {}
            }
        }
    }

    async fn auth_sasl(&mut self, cfg: &SourceConfig, mechanisms: &[u8]) -> Result<()> {
        let offered: Vec<String> = mechanisms
            .split(|&b| b == 0)
            .filter(|m| !m.is_empty())
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .collect();
        if !offered.iter().any(|m| m == crate::auth::scram::MECHANISM) {
            return Err(StreamerError::Auth(format!(
                "server does not offer SCRAM-SHA-256: {offered:?}"
            )));
        }

        #[cfg(not(feature = "scram"))]
        {
            let _ = cfg;
            Err(StreamerError::Auth("SCRAM feature disabled".into()))
        }

        #[cfg(feature = "scram")]
        {
            let mut scram = crate::auth::ScramSha256::new(&cfg.user);
            let first = scram.client_first();

            // SASLInitialResponse: mechanism\0 + int32(len) + client-first
            let mut init = Vec::with_capacity(first.len() + 32);
            init.extend_from_slice(crate::auth::scram::MECHANISM.as_bytes());
            init.push(0);
            init.extend_from_slice(&(first.len() as i32).to_be_bytes());
            init.extend_from_slice(first.as_bytes());
            write_password_message(&mut self.stream, &init).await?;

            let server_first = self.read_sasl(11).await?;
            let client_final = scram.client_final(&cfg.password, &server_first)?;
            write_password_message(&mut self.stream, client_final.as_bytes()).await?;

            let server_final = self.read_sasl(12).await?;
            scram.verify_server_final(&server_final)
        }
    }

    #[cfg(feature = "scram")]
    async fn read_sasl(&mut self, want_code: i32) -> Result<String> {
        let msg = self.read().await?;
        match msg.tag {
            b'R' => {
                let (code, rest) = parse_auth_request(&msg.payload)?;
                if code != want_code {
                    return Err(StreamerError::Auth(format!(
                        "unexpected auth code {code}, expected {want_code}"
                    )));
                }
                Ok(String::from_utf8_lossy(rest).into_owned())
            }
            b'E' => Err(StreamerError::Server(parse_error_response(&msg.payload))),
            other => Err(StreamerError::Protocol(format!(
                "unexpected message '{}' during SASL exchange",
                other as char
            ))),
        }
    }

    /// Run one statement through the simple query protocol; rows come back as text.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<SimpleRow>> {
        write_query(&mut self.stream, sql).await?;
        let mut columns: Arc<[String]> = Arc::from(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'T' => columns = Arc::from(parse_row_description(&msg.payload)?),
                b'D' => rows.push(SimpleRow {
                    columns: Arc::clone(&columns),
                    values: parse_data_row(&msg.payload)?,
                }),
                b'C' | b'I' => {}
                b'E' => failure = Some(StreamerError::Server(parse_error_response(&msg.payload))),
                b'Z' => break,
                b'G' | b'H' | b'W' => {
                    return Err(StreamerError::Protocol(format!(
                        "unexpected copy response to simple query: {sql}"
                    )));
                }
                other => debug!(tag = %(other as char), "ignoring message in simple query"),
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Simple query whose result rows are not needed.
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.simple_query(sql).await.map(|_| ())
    }

    /// Start `COPY ... TO STDOUT`; pull rows with [`PgConnection::copy_out_row`].
    pub async fn copy_out(&mut self, sql: &str) -> Result<()> {
        write_query(&mut self.stream, sql).await?;
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'H' => return Ok(()),
                b'E' => {
                    let err = StreamerError::Server(parse_error_response(&msg.payload));
                    self.drain_until_ready().await?;
                    return Err(err);
                }
                _ => {}
            }
        }
    }

    /// Next COPY row, or `None` once the server has finished the copy.
    pub async fn copy_out_row(&mut self) -> Result<Option<Bytes>> {
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'd' => return Ok(Some(msg.payload)),
                b'c' => {
                    self.drain_until_ready().await?;
                    return Ok(None);
                }
                b'E' => {
                    let err = StreamerError::Server(parse_error_response(&msg.payload));
                    self.drain_until_ready().await?;
                    return Err(err);
                }
                _ => {}
            }
        }
    }

    async fn drain_until_ready(&mut self) -> Result<()> {
        loop {
            if self.read().await?.tag == b'Z' {
                return Ok(());
            }
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| StreamerError::Protocol("IDENTIFY_SYSTEM returned no row".into()))?;
        Ok(SystemIdentity {
            system_id: row.require("systemid")?.to_string(),
            timeline: row
                .require("timeline")?
                .parse()
                .map_err(|e| StreamerError::Protocol(format!("bad timeline: {e}")))?,
            xlog_pos: Lsn::parse(row.require("xlogpos")?)?,
        })
    }

    /// Create a pgoutput slot; returns its consistent point.
    pub async fn create_replication_slot(
        &mut self,
        slot: &str,
        snapshot: SnapshotAction,
    ) -> Result<Lsn> {
        let action = match snapshot {
            SnapshotAction::NoExport => "NOEXPORT_SNAPSHOT",
            SnapshotAction::Use => "USE_SNAPSHOT",
        };
        let sql = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput {action}",
            quote_identifier(slot)
        );
        let rows = self.simple_query(&sql).await?;
        let row = rows.first().ok_or_else(|| {
            StreamerError::Protocol("CREATE_REPLICATION_SLOT returned no row".into())
        })?;
        Ok(Lsn::parse(row.require("consistent_point")?)?)
    }

    pub async fn drop_replication_slot(&mut self, slot: &str) -> Result<()> {
        self.execute(&format!("DROP_REPLICATION_SLOT {}", quote_identifier(slot)))
            .await
    }

    /// Enter COPY-both mode for a logical slot.
    pub async fn start_replication(
        &mut self,
        slot: &str,
        start: Lsn,
        options: &[(&str, String)],
    ) -> Result<()> {
        let opts = options
            .iter()
            .map(|(k, v)| format!("{} '{}'", quote_identifier(k), v.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "START_REPLICATION SLOT {} LOGICAL {start} ({opts})",
            quote_identifier(slot)
        );
        write_query(&mut self.stream, &sql).await?;

        // Wait for CopyBothResponse ('W')
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'W' => return Ok(()),
                b'E' => return Err(StreamerError::Server(parse_error_response(&msg.payload))),
                _ => {}
            }
        }
    }

    /// Next replication message. `None` means the server ended the stream.
    ///
    /// Cancel safe, so it can be raced against a deadline.
    pub async fn recv_replication(&mut self) -> Result<Option<StreamMessage>> {
        loop {
            let msg = self.read().await?;
            match msg.tag {
                b'd' => return StreamMessage::decode(msg.payload).map(Some),
                b'c' => return Ok(None),
                b'E' => return Err(StreamerError::Server(parse_error_response(&msg.payload))),
                other => debug!(tag = %(other as char), "ignoring message in copy-both mode"),
            }
        }
    }

    pub async fn send_standby_status(&mut self, acked: Lsn, reply_requested: bool) -> Result<()> {
        let update = StatusUpdate {
            reply: reply_requested,
            ..StatusUpdate::now(acked)
        };
        write_copy_data(&mut self.stream, &update.encode()).await
    }

    pub async fn finish_replication(&mut self) -> Result<()> {
        write_copy_done(&mut self.stream).await
    }

    /// Send Terminate; errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = write_terminate(&mut self.stream).await;
    }
}
