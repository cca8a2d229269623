//! Redis `PUBLISH` over a plain RESP connection.
//!
//! The connection is opened on first use and dropped after any I/O or
//! protocol error; the next publish reconnects.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use qdepth_core::config::StatusConfig;
use qdepth_core::{CollaboratorError, CollaboratorResult, StatusEvent, StatusSink};

const SERVICE: &str = "status";

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// A single-line server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Integer(i64),
    Error(String),
}

impl Reply {
    /// Parse one reply line, CRLF already stripped.
    pub fn parse(line: &str) -> CollaboratorResult<Self> {
        let (kind, rest) = line.split_at_checked(1).ok_or_else(|| {
            CollaboratorError::malformed(SERVICE, "empty reply")
        })?;
        match kind {
            "+" => Ok(Self::Status(rest.to_string())),
            "-" => Ok(Self::Error(rest.to_string())),
            ":" => rest
                .parse()
                .map(Self::Integer)
                .map_err(|_| CollaboratorError::malformed(SERVICE, format!("bad integer reply: {line}"))),
            _ => Err(CollaboratorError::malformed(
                SERVICE,
                format!("unexpected reply: {line}"),
            )),
        }
    }
}

type Connection = BufStream<TcpStream>;

/// Publishes status events to a Redis channel.
pub struct RedisPublisher {
    address: String,
    channel: String,
    password: Option<String>,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl RedisPublisher {
    pub fn new(config: &StatusConfig, connect_timeout: Duration) -> Self {
        Self {
            address: config.address.clone(),
            channel: config.channel.clone(),
            password: config.password.clone(),
            connect_timeout,
            connection: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&self) -> CollaboratorResult<Connection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| CollaboratorError::Timeout {
                service: SERVICE,
                elapsed: self.connect_timeout,
            })?
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e))?;
        let mut conn = BufStream::new(stream);

        if let Some(password) = &self.password {
            match command(&mut conn, &[b"AUTH", password.as_bytes()]).await? {
                Reply::Error(e) => {
                    return Err(CollaboratorError::unavailable(SERVICE, format!("AUTH rejected: {e}")));
                }
                _ => debug!(address = %self.address, "authenticated"),
            }
        }

        debug!(address = %self.address, "connected to redis");
        Ok(conn)
    }

    /// `PUBLISH` a payload. Returns the number of subscribers that got it.
    ///
    /// The connection is taken out of its slot while the command is in
    /// flight and put back only after a clean reply, so a publish dropped
    /// mid-command never leaves a half-read stream behind.
    pub async fn publish_raw(&self, payload: &[u8]) -> CollaboratorResult<i64> {
        let mut guard = self.connection.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        match command(&mut conn, &[b"PUBLISH", self.channel.as_bytes(), payload]).await? {
            Reply::Integer(receivers) => {
                *guard = Some(conn);
                Ok(receivers)
            }
            Reply::Error(e) => {
                *guard = Some(conn);
                Err(CollaboratorError::unavailable(SERVICE, e))
            }
            other => Err(CollaboratorError::malformed(
                SERVICE,
                format!("unexpected PUBLISH reply: {other:?}"),
            )),
        }
    }
}

/// Send one command and read its reply.
async fn command(conn: &mut Connection, args: &[&[u8]]) -> CollaboratorResult<Reply> {
    conn.write_all(&encode_command(args))
        .await
        .map_err(|e| CollaboratorError::unavailable(SERVICE, e))?;
    conn.flush()
        .await
        .map_err(|e| CollaboratorError::unavailable(SERVICE, e))?;

    let mut line = String::new();
    let read = conn
        .read_line(&mut line)
        .await
        .map_err(|e| CollaboratorError::unavailable(SERVICE, e))?;
    if read == 0 {
        return Err(CollaboratorError::unavailable(SERVICE, "connection closed"));
    }
    Reply::parse(line.trim_end_matches(['\r', '\n']))
}

#[async_trait]
impl StatusSink for RedisPublisher {
    async fn publish(&self, event: StatusEvent) -> CollaboratorResult<()> {
        let payload =
            serde_json::to_vec(&event).map_err(|e| CollaboratorError::malformed(SERVICE, e))?;
        let receivers = self.publish_raw(&payload).await?;
        if receivers == 0 {
            warn!(channel = %self.channel, event = %event.event, "status event had no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config(address: String, password: Option<&str>) -> StatusConfig {
        StatusConfig {
            address,
            channel: "events".to_string(),
            password: password.map(str::to_string),
            host: None,
        }
    }

    /// Read exactly `frame.len()` bytes and check they match.
    async fn expect_frame(socket: &mut TcpStream, frame: &[u8]) {
        let mut buf = vec![0u8; frame.len()];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), String::from_utf8_lossy(frame));
    }

    #[test]
    fn encodes_bulk_string_array() {
        let frame = encode_command(&[b"PUBLISH", b"events", b"{}"]);
        assert_eq!(frame, b"*3\r\n$7\r\nPUBLISH\r\n$6\r\nevents\r\n$2\r\n{}\r\n");
    }

    #[test]
    fn parses_replies() {
        assert_eq!(Reply::parse("+OK").unwrap(), Reply::Status("OK".to_string()));
        assert_eq!(Reply::parse(":3").unwrap(), Reply::Integer(3));
        assert_eq!(
            Reply::parse("-NOAUTH Authentication required.").unwrap(),
            Reply::Error("NOAUTH Authentication required.".to_string())
        );
        assert!(Reply::parse("").is_err());
        assert!(Reply::parse("$5").is_err());
    }

    #[tokio::test]
    async fn publishes_json_event_after_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let event = StatusEvent {
            event: "scaleUp".to_string(),
            deployment: Some("svc-a".to_string()),
            host: "node-a".to_string(),
        };
        let payload = serde_json::to_vec(&event).unwrap();
        let expected = encode_command(&[b"PUBLISH", b"events", &payload]);

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            expect_frame(&mut socket, &encode_command(&[b"AUTH", b"hunter2"])).await;
            socket.write_all(b"+OK\r\n").await.unwrap();
            expect_frame(&mut socket, &expected).await;
            socket.write_all(b":1\r\n").await.unwrap();
        });

        let publisher = RedisPublisher::new(&config(addr.to_string(), Some("hunter2")), Duration::from_secs(1));
        publisher.publish(event).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reuses_connection_between_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for payload in [b"one".as_slice(), b"two".as_slice()] {
                expect_frame(&mut socket, &encode_command(&[b"PUBLISH", b"events", payload])).await;
                socket.write_all(b":0\r\n").await.unwrap();
            }
        });

        let publisher = RedisPublisher::new(&config(addr.to_string(), None), Duration::from_secs(1));
        assert_eq!(publisher.publish_raw(b"one").await.unwrap(), 0);
        assert_eq!(publisher.publish_raw(b"two").await.unwrap(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_auth_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            expect_frame(&mut socket, &encode_command(&[b"AUTH", b"wrong"])).await;
            socket.write_all(b"-WRONGPASS invalid password\r\n").await.unwrap();
        });

        let publisher = RedisPublisher::new(&config(addr.to_string(), Some("wrong")), Duration::from_secs(1));
        let err = publisher.publish_raw(b"{}").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection closes without replying.
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);

            let (mut socket, _) = listener.accept().await.unwrap();
            expect_frame(&mut socket, &encode_command(&[b"PUBLISH", b"events", b"retry"])).await;
            socket.write_all(b":2\r\n").await.unwrap();
        });

        let publisher = RedisPublisher::new(&config(addr.to_string(), None), Duration::from_secs(1));
        assert!(publisher.publish_raw(b"lost").await.is_err());
        assert_eq!(publisher.publish_raw(b"retry").await.unwrap(), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_publish_does_not_shift_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (replied_tx, replied_rx) = tokio::sync::oneshot::channel();

        let server = tokio::spawn(async move {
            let (mut slow, _) = listener.accept().await.unwrap();
            expect_frame(&mut slow, &encode_command(&[b"PUBLISH", b"events", b"one"])).await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            // Late reply on the abandoned connection.
            let _ = slow.write_all(b":7\r\n").await;
            let _ = replied_tx.send(());

            let (mut socket, _) = listener.accept().await.unwrap();
            expect_frame(&mut socket, &encode_command(&[b"PUBLISH", b"events", b"two"])).await;
            socket.write_all(b":0\r\n").await.unwrap();
            drop(slow);
        });

        let publisher = RedisPublisher::new(&config(addr.to_string(), None), Duration::from_secs(1));
        let first = tokio::time::timeout(Duration::from_millis(100), publisher.publish_raw(b"one")).await;
        assert!(first.is_err());

        replied_rx.await.unwrap();
        assert_eq!(publisher.publish_raw(b"two").await.unwrap(), 0);
        server.await.unwrap();
    }
}
