//! Line-delimited JSON transports.
//!
//! Both transports speak the same protocol: one [`ToolRequest`] per line in,
//! one [`ToolResponse`] per line out. Stdio serves a single client; the TCP
//! listener serves each connection on its own thread. Lines longer than
//! [`MAX_REQUEST_SIZE`] are refused before any parsing or authentication.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::auth::AuthError;
use crate::context::{CancelToken, RequestContext};
use crate::tools::{ToolRequest, ToolResponse, Toolbox};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest accepted request line, newline included.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Outcome of reading one request line.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line,
    Oversized,
    Eof,
}

pub struct Server {
    toolbox: Arc<Toolbox>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(toolbox: Arc<Toolbox>) -> Self {
        Self {
            toolbox,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serve one client on stdin/stdout until stdin closes.
    pub fn serve_stdio(&self) -> Result<()> {
        debug!("client connected via stdin/stdout");
        let stdin = io::stdin();
        let stdout = io::stdout();
        self.serve_lines(
            stdin.lock(),
            stdout.lock(),
            CancelToken::from_flag(self.shutdown_flag()),
        )
    }

    /// Answer every request line from `reader` on `writer`.
    ///
    /// Bytes that are not UTF-8 and oversized lines are answered with
    /// `invalid_request`; the session carries on with the next line.
    pub fn serve_lines<R: BufRead, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        cancel: CancelToken,
    ) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            match read_frame(&mut reader, &mut buf).context("Failed to read request")? {
                Frame::Eof => break,
                Frame::Line => {
                    let response = self.respond(&String::from_utf8_lossy(&buf), &cancel);
                    buf.clear();
                    if let Some(response) = response {
                        write_response(&mut writer, &response)?;
                    }
                }
                Frame::Oversized => {
                    let terminated = buf.last() == Some(&b'\n');
                    buf.clear();
                    if !terminated {
                        reader
                            .skip_until(b'\n')
                            .context("Failed to skip oversized request")?;
                    }
                    write_response(&mut writer, &oversized())?;
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }
        Ok(())
    }

    /// Listen on `addr` until SIGINT/SIGTERM.
    pub fn serve_tcp(&self, addr: &str) -> Result<()> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("Failed to bind {addr}"))?;
        self.serve_listener(listener)
    }

    pub fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        let shutdown = self.shutdown_flag();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("Failed to set signal handler")?;

        // Set non-blocking so we can check shutdown flag
        listener.set_nonblocking(true)?;
        info!(address = %listener.local_addr()?, "listening");

        let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();
        let mut accepted = 0u64;
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    debug!(%peer, "client connected");
                    let server = self.handle();
                    let worker = thread::Builder::new()
                        .name(format!("conn-{accepted}"))
                        .spawn(move || {
                            if let Err(err) = server.serve_connection(stream) {
                                warn!(%peer, error = %err, "connection error");
                            }
                            debug!(%peer, "client disconnected");
                        })
                        .context("Failed to spawn connection thread")?;
                    workers.push(worker);
                    workers.retain(|w| !w.is_finished());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        info!("shutting down");
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    fn handle(&self) -> Server {
        Server {
            toolbox: Arc::clone(&self.toolbox),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let probe = stream.try_clone()?;
        let cancel = CancelToken::from_flag(self.shutdown_flag()).with_probe(move || peer_closed(&probe));
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            match read_frame(&mut reader, &mut buf) {
                Ok(Frame::Eof) => break,
                Ok(Frame::Line) => {
                    let response = self.respond(&String::from_utf8_lossy(&buf), &cancel);
                    buf.clear();
                    if let Some(response) = response {
                        write_response(&mut writer, &response)?;
                    }
                }
                Ok(Frame::Oversized) => {
                    warn!(limit = MAX_REQUEST_SIZE, "dropping connection after oversized request");
                    write_response(&mut writer, &oversized())?;
                    break;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Parse, authenticate and dispatch one request line.
    fn respond(
        &self,
        line: &str,
        cancel: &CancelToken,
    ) -> Option<ToolResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let request: ToolRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "malformed request");
                return Some(ToolResponse::failure(
                    serde_json::Value::Null,
                    "invalid_request",
                    format!("malformed request: {err}"),
                ));
            }
        };

        match self.authenticate(&request, cancel) {
            Ok(ctx) => Some(self.toolbox.handle(&ctx, request)),
            Err(err) => {
                debug!(tool = %request.tool, error = %err, "request rejected");
                Some(ToolResponse::failure(request.id, "unauthorized", err.to_string()))
            }
        }
    }

    /// Build the request context, requiring a readable bearer token in
    /// remote mode.
    fn authenticate(
        &self,
        request: &ToolRequest,
        cancel: &CancelToken,
    ) -> Result<RequestContext, AuthError> {
        let ctx = RequestContext::new(cancel.clone());
        let Some(verifier) = self.toolbox.auth().verifier() else {
            return Ok(ctx);
        };
        let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
        let verified = verifier.verify(token)?;
        verifier.check_read(Some(&verified))?;
        Ok(ctx.with_token(verified))
    }
}

/// Read one line into `buf`, never holding more than [`MAX_REQUEST_SIZE`]
/// bytes of it.
///
/// A read that fails (for instance on a socket read timeout) leaves the bytes
/// read so far in `buf`, and the next call continues the same line.
fn read_frame<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame> {
    let remaining = (MAX_REQUEST_SIZE + 1).saturating_sub(buf.len()) as u64;
    let read = (&mut *reader).take(remaining).read_until(b'\n', buf)?;
    if buf.len() > MAX_REQUEST_SIZE {
        Ok(Frame::Oversized)
    } else if read == 0 && buf.is_empty() {
        Ok(Frame::Eof)
    } else {
        Ok(Frame::Line)
    }
}

fn oversized() -> ToolResponse {
    ToolResponse::failure(
        serde_json::Value::Null,
        "invalid_request",
        format!("request exceeds {MAX_REQUEST_SIZE} bytes"),
    )
}

fn write_response<W: Write>(writer: &mut W, response: &ToolResponse) -> Result<()> {
    serde_json::to_writer(&mut *writer, response).context("Failed to encode response")?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// True once the peer has shut down its side of the connection.
///
/// A client that half-closes (shuts down only its write side) counts as gone:
/// clients keep the connection fully open while they wait for an answer.
fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let closed = match stream.peek(&mut [0u8; 1]) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::StaticKey;
    use crate::auth::{AuthArbiter, AuthSettings, DEFAULT_TIMEOUT, Grants, TokenVerifier};
    use crate::units::mock::MockBackend;
    use crate::units::{JobTracker, UnitManager};
    use serde_json::{Value, json};
    use std::io::Cursor;

    fn server(auth: AuthArbiter) -> Server {
        let auth = Arc::new(auth);
        let units = Arc::new(UnitManager::new(
            Arc::new(MockBackend::new()),
            auth.clone(),
            Arc::new(JobTracker::new()),
        ));
        Server::new(Arc::new(Toolbox::new(auth, Some(units), None)))
    }

    fn exchange(server: &Server, input: &str) -> Vec<Value> {
        exchange_bytes(server, input.as_bytes())
    }

    fn exchange_bytes(server: &Server, input: &[u8]) -> Vec<Value> {
        let mut output = Vec::new();
        server
            .serve_lines(Cursor::new(input), &mut output, CancelToken::new())
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_one_response_per_request() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let responses = exchange(
            &server,
            "{\"id\":1,\"tool\":\"list_units\"}\n\n{\"id\":2,\"tool\":\"check_restart_reload\"}\n",
        );
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], json!({"id": 1, "ok": true, "result": []}));
        assert_eq!(responses[1]["result"]["status"], "no_pending_operation");
    }

    #[test]
    fn test_malformed_line() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let responses = exchange(&server, "not json\n");
        assert_eq!(responses[0]["ok"], false);
        assert_eq!(responses[0]["error"]["kind"], "invalid_request");
    }

    #[test]
    fn test_invalid_utf8_line_does_not_end_session() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let responses = exchange_bytes(&server, b"\xff\xfe\n{\"id\":1,\"tool\":\"deauthorize\"}\n");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["kind"], "invalid_request");
        assert_eq!(responses[1], json!({"id": 1, "ok": true, "result": {"deauthorized": true}}));
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let mut input = vec![b'x'; MAX_REQUEST_SIZE + 16];
        input.extend_from_slice(b"\n{\"id\":2,\"tool\":\"deauthorize\"}\n");

        let responses = exchange_bytes(&server, &input);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["kind"], "invalid_request");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["ok"], true);
    }

    #[test]
    fn test_last_line_without_newline() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let responses = exchange(&server, "{\"id\":3,\"tool\":\"deauthorize\"}");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 3);
    }

    #[test]
    fn test_remote_mode_requires_token() {
        let verifier = TokenVerifier::new(
            Arc::new(StaticKey::new(jsonwebtoken::DecodingKey::from_secret(b"unused"))),
            AuthSettings::default(),
        );
        let server = server(AuthArbiter::remote(Arc::new(verifier), DEFAULT_TIMEOUT));

        let responses = exchange(
            &server,
            "{\"id\":\"a\",\"tool\":\"list_units\"}\n{\"id\":\"b\",\"tool\":\"list_units\",\"token\":\"garbage\"}\n",
        );
        assert_eq!(responses[0]["error"]["kind"], "unauthorized");
        assert_eq!(responses[0]["error"]["message"], "no bearer token presented");
        assert_eq!(responses[1]["id"], "b");
        assert_eq!(responses[1]["error"]["message"], "invalid token");
    }

    #[test]
    fn test_tcp_connection_round_trip() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_flag();

        let handle = server.handle();
        let conn = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle.serve_connection(stream).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(b"{\"id\":7,\"tool\":\"deauthorize\"}\n")
            .unwrap();
        let mut line = String::new();
        BufReader::new(client.try_clone().unwrap())
            .read_line(&mut line)
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["ok"], true);

        drop(client);
        conn.join().unwrap();
        assert!(!shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tcp_oversized_request_closes_connection() {
        let server = server(AuthArbiter::disabled(Grants::ALL));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = server.handle();
        let conn = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handle.serve_connection(stream).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&vec![b'x'; MAX_REQUEST_SIZE + 1]).unwrap();

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["error"]["kind"], "invalid_request");

        conn.join().unwrap();
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn test_half_closed_peer_counts_as_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(peer_closed(&stream));
    }

    #[test]
    fn test_peer_closed_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        assert!(!peer_closed(&stream));
        drop(client);
        // Give the FIN a moment to arrive.
        thread::sleep(Duration::from_millis(50));
        assert!(peer_closed(&stream));
    }
}
