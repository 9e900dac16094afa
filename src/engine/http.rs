//! Engine sessions hosted by a remote gateway over HTTP/JSON.
use super::{Engine, EngineSession, SessionError, TraceChunk};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    output: Vec<String>,
    #[serde(default)]
    fault: Option<String>,
}

pub struct HttpEngine {
    agent: ureq::Agent,
    base_url: String,
    request_timeout: Duration,
}

impl HttpEngine {
    pub fn new(config: HttpEngineConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout))
            .build()
            .into();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }
}

fn map_error(err: ureq::Error, timeout: Duration) -> SessionError {
    match err {
        ureq::Error::Timeout(_) => SessionError::Timeout(timeout),
        ureq::Error::StatusCode(404 | 410) => {
            SessionError::Closed("remote session no longer exists".to_string())
        }
        other => SessionError::Io(other.to_string()),
    }
}

impl Engine for HttpEngine {
    fn open_session(&self) -> Result<Box<dyn EngineSession>, SessionError> {
        let url = format!("{}/sessions", self.base_url);
        let opened: OpenSessionResponse = self
            .agent
            .post(&url)
            .send_empty()
            .and_then(|mut resp| resp.body_mut().read_json())
            .map_err(|err| map_error(err, self.request_timeout))?;
        tracing::debug!(session_id = %opened.session_id, "remote engine session opened");
        Ok(Box::new(HttpSession {
            agent: self.agent.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, opened.session_id),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        format!("http:{}", self.base_url)
    }
}

struct HttpSession {
    agent: ureq::Agent,
    session_url: String,
    closed: bool,
}

impl EngineSession for HttpSession {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<TraceChunk, SessionError> {
        if self.closed {
            return Err(SessionError::Closed("session already closed".to_string()));
        }
        let url = format!("{}/commands", self.session_url);
        let reply: CommandResponse = self
            .agent
            .post(&url)
            .config()
            .timeout_global(Some(timeout))
            .build()
            .send_json(&CommandRequest { command })
            .and_then(|mut resp| resp.body_mut().read_json())
            .map_err(|err| map_error(err, timeout))?;
        if let Some(fault) = reply.fault {
            let mut text = reply.output;
            text.push(fault);
            return Err(SessionError::Fault(text.join("\n")));
        }
        Ok(TraceChunk::new(command, reply.output))
    }

    fn ping(&mut self, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        let url = format!("{}/health", self.session_url);
        self.agent
            .get(&url)
            .config()
            .timeout_global(Some(timeout))
            .build()
            .call()
            .is_ok()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.agent.delete(&self.session_url).call() {
            tracing::warn!(url = %self.session_url, error = %err, "remote session close failed");
        }
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;

    struct Canned {
        status: u16,
        body: String,
        delay: Duration,
    }

    fn ok(body: &str) -> Canned {
        Canned {
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn status(code: u16) -> Canned {
        Canned {
            status: code,
            body: "{}".to_string(),
            delay: Duration::ZERO,
        }
    }

    type Handler = dyn Fn(&str, &str, &str) -> Canned + Send + Sync;

    /// One-request-per-connection HTTP/1.1 gateway serving canned JSON.
    /// Returns the base URL and the log of `METHOD PATH BODY` lines.
    fn serve(handler: Arc<Handler>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&log);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).is_err() || header.trim().is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                }
                let mut body = vec![0u8; content_length];
                let _ = reader.read_exact(&mut body);
                let body = String::from_utf8_lossy(&body).to_string();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let path = parts.next().unwrap_or("").to_string();
                seen.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("{method} {path} {body}").trim_end().to_string());

                let canned = handler(&method, &path, &body);
                thread::sleep(canned.delay);
                let response = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    canned.status,
                    canned.body.len(),
                    canned.body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}"), log)
    }

    fn engine(base_url: &str) -> HttpEngine {
        HttpEngine::new(HttpEngineConfig {
            base_url: format!("{base_url}/"),
            request_timeout: Duration::from_secs(5),
        })
    }

    fn routes(log: &Mutex<Vec<String>>) -> Vec<String> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[test]
    fn session_lifecycle_uses_gateway_routes() {
        let (base, log) = serve(Arc::new(|method: &str, path: &str, _body: &str| {
            match (method, path) {
                ("POST", "/sessions") => ok(r#"{"session_id":"s1"}"#),
                ("POST", "/sessions/s1/commands") => {
                    ok(r#"{"output":[" PARAMETER A =     1.00000000"]}"#)
                }
                ("GET", "/sessions/s1/health") => ok("{}"),
                ("DELETE", "/sessions/s1") => ok("{}"),
                _ => status(400),
            }
        }));
        let engine = engine(&base);
        assert_eq!(engine.describe(), format!("http:{base}"));

        let mut session = engine.open_session().expect("open");
        let chunk = session.send("A = 1", Duration::from_secs(5)).expect("send");
        assert_eq!(chunk.command, "A = 1");
        assert_eq!(chunk.lines, vec![" PARAMETER A =     1.00000000"]);
        assert!(session.ping(Duration::from_secs(5)));
        session.close();
        assert!(!session.ping(Duration::from_secs(5)));
        assert!(matches!(
            session.send("A = 2", Duration::from_secs(5)),
            Err(SessionError::Closed(_))
        ));

        assert_eq!(
            routes(&log),
            vec![
                "POST /sessions".to_string(),
                r#"POST /sessions/s1/commands {"command":"A = 1"}"#.to_string(),
                "GET /sessions/s1/health".to_string(),
                "DELETE /sessions/s1".to_string(),
            ]
        );
    }

    #[test]
    fn fault_field_becomes_session_fault() {
        let (base, _log) = serve(Arc::new(|method: &str, path: &str, _body: &str| {
            match (method, path) {
                ("POST", "/sessions") => ok(r#"{"session_id":"s2"}"#),
                ("POST", "/sessions/s2/commands") => {
                    ok(r#"{"output":[" solving"],"fault":"*** ERROR *** singular matrix"}"#)
                }
                _ => ok("{}"),
            }
        }));
        let mut session = engine(&base).open_session().expect("open");
        match session.send("SOLVE", Duration::from_secs(5)) {
            Err(SessionError::Fault(text)) => {
                assert_eq!(text, " solving\n*** ERROR *** singular matrix");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn vanished_remote_session_maps_to_closed() {
        for code in [404, 410] {
            let (base, _log) = serve(Arc::new(move |method: &str, path: &str, _body: &str| {
                match (method, path) {
                    ("POST", "/sessions") => ok(r#"{"session_id":"gone"}"#),
                    ("POST", _) | ("GET", _) => status(code),
                    _ => ok("{}"),
                }
            }));
            let mut session = engine(&base).open_session().expect("open");
            assert!(
                matches!(
                    session.send("A = 1", Duration::from_secs(5)),
                    Err(SessionError::Closed(_))
                ),
                "status {code}"
            );
            assert!(!session.ping(Duration::from_secs(5)));
        }
    }

    #[test]
    fn server_errors_map_to_io() {
        let (base, _log) = serve(Arc::new(|_method: &str, _path: &str, _body: &str| status(503)));
        assert!(matches!(
            engine(&base).open_session(),
            Err(SessionError::Io(_))
        ));
    }

    #[test]
    fn slow_reply_maps_to_timeout() {
        let (base, _log) = serve(Arc::new(|method: &str, path: &str, _body: &str| {
            match (method, path) {
                ("POST", "/sessions") => ok(r#"{"session_id":"s3"}"#),
                ("POST", "/sessions/s3/commands") => Canned {
                    delay: Duration::from_millis(500),
                    ..ok(r#"{"output":[]}"#)
                },
                _ => ok("{}"),
            }
        }));
        let mut session = engine(&base).open_session().expect("open");
        let timeout = Duration::from_millis(50);
        match session.send("/WAIT,10", timeout) {
            Err(SessionError::Timeout(waited)) => assert_eq!(waited, timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
