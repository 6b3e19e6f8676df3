//! TCP server loop and startup snapshot loading.

use crate::db::Keyspace;
use crate::session::Session;
use bytes::BytesMut;
use marlin_common::{MarlinError, Result, ServerConfig};
use marlin_resp::{decode_command, ReplyEncoder};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// A MarlinDB server instance: configuration plus the keyspace shared by
/// every connection.
pub struct Server {
    config: Arc<ServerConfig>,
    keyspace: Arc<Keyspace>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        if config.databases == 0 {
            return Err(MarlinError::Config(
                "at least one database is required".to_string(),
            ));
        }
        let keyspace = Arc::new(Keyspace::new(config.databases));
        Ok(Self {
            config: Arc::new(config),
            keyspace,
        })
    }

    /// The keyspace backing this server.
    pub fn keyspace(&self) -> Arc<Keyspace> {
        Arc::clone(&self.keyspace)
    }

    /// Loads the configured RDB snapshot into the keyspace, if there is
    /// one. A missing file or unset location starts the server empty.
    pub fn load_snapshot(&self) -> Result<()> {
        let path = match self.config.snapshot.path() {
            Some(path) => path,
            None => return Ok(()),
        };

        let snapshot = match marlin_rdb::read_snapshot_file(&path)? {
            Some(snapshot) => snapshot,
            None => {
                info!(path = %path.display(), "no snapshot file, starting empty");
                return Ok(());
            }
        };

        let count = snapshot.records.len();
        for record in snapshot.records {
            self.keyspace
                .db(record.db_index)?
                .set_string(&record.key, record.value, record.expires_at);
        }
        info!(
            path = %path.display(),
            version = snapshot.version,
            keys = count,
            "loaded snapshot"
        );
        Ok(())
    }

    /// Accepts connections forever, one task per client.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            let (socket, addr) = listener.accept().await?;
            debug!(%addr, "client connected");

            let keyspace = Arc::clone(&self.keyspace);
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, keyspace, config).await {
                    warn!(%addr, %err, "connection ended with error");
                }
                debug!(%addr, "client disconnected");
            });
        }
    }
}

/// Reads commands off one connection and writes replies until the client
/// goes away.
async fn handle_connection(
    mut socket: TcpStream,
    keyspace: Arc<Keyspace>,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let mut session = Session::new(keyspace, config);
    let mut buf = BytesMut::with_capacity(4 * 1024);

    loop {
        match decode_command(&mut buf) {
            Ok(Some(cmd)) => {
                let reply = session.dispatch(cmd).await;
                socket.write_all(&reply).await?;
                continue;
            }
            Ok(None) => {} // need more bytes
            Err(err) => {
                // The read buffer is beyond repair; tell the client and
                // hang up rather than guess where the next command starts.
                error!(%err, "dropping connection on protocol error");
                let mut enc = ReplyEncoder::new();
                enc.write_error(&format!("ERR {err}"));
                let _ = socket.write_all(&enc.into_bytes()).await;
                return Ok(());
            }
        }

        let read = socket.read_buf(&mut buf).await?;
        if read == 0 {
            // EOF; a partial command left in the buffer is discarded.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_new_rejects_zero_databases() {
        let config = ServerConfig {
            databases: 0,
            ..Default::default()
        };
        assert!(matches!(Server::new(config), Err(MarlinError::Config(_))));
    }

    #[test]
    fn test_load_snapshot_without_location_is_noop() {
        let server = Server::new(ServerConfig::default()).unwrap();
        server.load_snapshot().unwrap();
    }

    #[test]
    fn test_load_snapshot_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot: marlin_common::SnapshotConfig {
                dir: Some(dir.path().to_path_buf()),
                dbfilename: Some("missing.rdb".to_string()),
            },
            ..Default::default()
        };
        let server = Server::new(config).unwrap();
        server.load_snapshot().unwrap();
    }

    #[test]
    fn test_load_snapshot_populates_keyspace() {
        // A handwritten snapshot: one plain key in db 0, one in db 1,
        // finished with EOF and a zeroed (skipped) checksum trailer.
        let mut data: Vec<u8> = b"REDIS0006".to_vec();
        data.extend_from_slice(&[254, 0]); // SELECTDB 0
        data.extend_from_slice(&[0, 3]);
        data.extend_from_slice(b"foo");
        data.extend_from_slice(&[3]);
        data.extend_from_slice(b"bar");
        data.extend_from_slice(&[254, 1]); // SELECTDB 1
        data.extend_from_slice(&[0, 1, b'k', 1, b'v']);
        data.push(255); // EOF
        data.extend_from_slice(&[0u8; 8]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&data).unwrap();

        let config = ServerConfig {
            snapshot: marlin_common::SnapshotConfig {
                dir: Some(dir.path().to_path_buf()),
                dbfilename: Some("dump.rdb".to_string()),
            },
            ..Default::default()
        };
        let server = Server::new(config).unwrap();
        server.load_snapshot().unwrap();

        let keyspace = server.keyspace();
        assert_eq!(
            keyspace.db(0).unwrap().get_string("foo").unwrap(),
            Some("bar".to_string())
        );
        assert_eq!(
            keyspace.db(1).unwrap().get_string("k").unwrap(),
            Some("v".to_string())
        );
        assert_eq!(keyspace.db(0).unwrap().get_string("k").unwrap(), None);
    }
}
