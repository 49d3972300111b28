//! PAC script retrieval.
//!
//! # Responsibility
//! - Download PAC scripts over `http`/`https` and read `file` locations.
//!
//! # Invariants
//! - Script downloads always go direct; the environment proxy is never used.
//! - Bodies larger than the configured cap are rejected, not truncated.
//! - A whole download, body included, is bounded by the fetch timeout.

use crate::logging::loggable_url;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};
use url::Url;

pub const PAC_MIME_TYPE: &str = "application/x-ns-proxy-autoconfig";
pub const DEFAULT_MAX_PAC_SIZE: u64 = 100 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("proxyfinder/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum FetchError {
    UnsupportedScheme(String),
    Transport(Box<ureq::Transport>),
    Status(u16),
    TooLarge { limit: u64 },
    TimedOut { after: Duration },
    Io {
        location: String,
        source: std::io::Error,
    },
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedScheme(scheme) => {
                write!(f, "unsupported PAC location scheme: {scheme}")
            }
            Self::Transport(err) => write!(f, "PAC transport failure: {err}"),
            Self::Status(code) => write!(f, "PAC server answered with status {code}"),
            Self::TooLarge { limit } => write!(f, "PAC script exceeds {limit} bytes"),
            Self::TimedOut { after } => {
                write!(f, "PAC download did not finish within {}ms", after.as_millis())
            }
            Self::Io { location, source } => {
                write!(f, "failed to read PAC script from `{location}`: {source}")
            }
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err.as_ref()),
            Self::Io { source, .. } => Some(source),
            Self::UnsupportedScheme(_)
            | Self::Status(_)
            | Self::TooLarge { .. }
            | Self::TimedOut { .. } => None,
        }
    }
}

impl From<ureq::Error> for FetchError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(transport) => Self::Transport(Box::new(transport)),
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Retrieves PAC script text.
pub trait PacFetcher: Send + Sync {
    fn fetch(&self, location: &Url) -> FetchResult<String>;
}

/// Default fetcher: `http`/`https` via a direct `ureq` agent, `file` via the
/// filesystem.
pub struct HttpPacFetcher {
    agent: ureq::Agent,
    timeout: Duration,
    max_size: u64,
}

impl HttpPacFetcher {
    pub fn new(timeout: Duration, max_size: u64) -> Self {
        let timeout = timeout.max(Duration::from_millis(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .try_proxy_from_env(false)
            .build();
        Self {
            agent,
            timeout,
            max_size,
        }
    }

    fn fetch_http(&self, location: &Url) -> FetchResult<String> {
        let deadline = Instant::now() + self.timeout;
        let response = self
            .agent
            .get(location.as_str())
            .set("Accept", PAC_MIME_TYPE)
            .call()?;

        if let Some(length) = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            if length > self.max_size {
                return Err(FetchError::TooLarge {
                    limit: self.max_size,
                });
            }
        }

        let body = self.read_body(response.into_reader(), deadline, location)?;
        self.finish(body)
    }

    /// Reads at most one byte past the cap, failing once `deadline` passes.
    fn read_body(
        &self,
        reader: impl Read,
        deadline: Instant,
        location: &Url,
    ) -> FetchResult<Vec<u8>> {
        let mut reader = reader.take(self.max_size.saturating_add(1));
        let mut body = Vec::new();
        let mut chunk = [0u8; 8 * 1024];
        loop {
            let read = match reader.read(&mut chunk) {
                Ok(0) => return Ok(body),
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if Instant::now() >= deadline => {
                    warn!(
                        "event=pac_fetch_read module=fetch status=timeout error={}",
                        err
                    );
                    return Err(FetchError::TimedOut {
                        after: self.timeout,
                    });
                }
                Err(source) => {
                    return Err(FetchError::Io {
                        location: loggable_url(location),
                        source,
                    })
                }
            };
            body.extend_from_slice(&chunk[..read]);
            if Instant::now() >= deadline {
                return Err(FetchError::TimedOut {
                    after: self.timeout,
                });
            }
        }
    }

    fn fetch_file(&self, location: &Url) -> FetchResult<String> {
        let path = location
            .to_file_path()
            .map_err(|_| FetchError::UnsupportedScheme(location.scheme().to_string()))?;
        let io_error = |source| FetchError::Io {
            location: path.display().to_string(),
            source,
        };

        let metadata = std::fs::metadata(&path).map_err(io_error)?;
        if metadata.len() > self.max_size {
            return Err(FetchError::TooLarge {
                limit: self.max_size,
            });
        }
        let body = std::fs::read(&path).map_err(io_error)?;
        self.finish(body)
    }

    fn finish(&self, body: Vec<u8>) -> FetchResult<String> {
        if body.len() as u64 > self.max_size {
            return Err(FetchError::TooLarge {
                limit: self.max_size,
            });
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl Default for HttpPacFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_PAC_SIZE)
    }
}

impl PacFetcher for HttpPacFetcher {
    fn fetch(&self, location: &Url) -> FetchResult<String> {
        let started_at = Instant::now();
        let result = match location.scheme() {
            "http" | "https" => self.fetch_http(location),
            "file" => self.fetch_file(location),
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        };

        match &result {
            Ok(body) => info!(
                "event=pac_fetch module=fetch status=ok location={} bytes={} duration_ms={}",
                loggable_url(location),
                body.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=pac_fetch module=fetch status=error location={} duration_ms={} error={}",
                loggable_url(location),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchError, HttpPacFetcher, PacFetcher, PAC_MIME_TYPE};
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};
    use url::Url;

    const SCRIPT: &str = "function FindProxyForURL(url, host) { return \"DIRECT\"; }";

    /// Serves one canned HTTP response on a loopback port.
    fn serve_once(status: &'static str, body: &'static str) -> (Url, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener address");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept one connection");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut request = String::new();
            loop {
                let mut line = String::new();
                let read = reader.read_line(&mut line).expect("read request line");
                if read == 0 || line == "\r\n" {
                    break;
                }
                request.push_str(&line);
            }
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            request
        });
        let url = Url::parse(&format!("http://{addr}/proxy.pac")).expect("server url");
        (url, handle)
    }

    /// Sends headers at once, then one body byte every `interval`.
    fn serve_slowly(body_len: usize, interval: Duration) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener address");
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept one connection");
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            loop {
                let mut line = String::new();
                let read = reader.read_line(&mut line).expect("read request line");
                if read == 0 || line == "\r\n" {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {body_len}\r\nConnection: close\r\n\r\n"
            );
            if stream.write_all(head.as_bytes()).is_err() {
                return;
            }
            for _ in 0..body_len {
                thread::sleep(interval);
                if stream.write_all(b"x").and_then(|_| stream.flush()).is_err() {
                    return;
                }
            }
        });
        Url::parse(&format!("http://{addr}/proxy.pac")).expect("server url")
    }

    #[test]
    fn trickling_server_cannot_outlast_the_fetch_timeout() {
        let url = serve_slowly(40, Duration::from_millis(100));
        let fetcher = HttpPacFetcher::new(Duration::from_millis(300), 1024);

        let started_at = Instant::now();
        let result = fetcher.fetch(&url);
        let elapsed = started_at.elapsed();

        assert!(result.is_err(), "a 4s trickle must not finish within 300ms");
        assert!(
            elapsed < Duration::from_secs(2),
            "fetch blocked for {elapsed:?}"
        );
    }

    #[test]
    fn unbounded_size_cap_still_reads_the_body() {
        let (url, server) = serve_once("200 OK", SCRIPT);
        let fetcher = HttpPacFetcher::new(Duration::from_secs(2), u64::MAX);

        assert_eq!(fetcher.fetch(&url).expect("fetch should succeed"), SCRIPT);
        server.join().expect("server thread");
    }

    #[test]
    fn downloads_script_with_pac_accept_header() {
        let (url, server) = serve_once("200 OK", SCRIPT);
        let fetcher = HttpPacFetcher::new(Duration::from_secs(2), 1024);

        let body = fetcher.fetch(&url).expect("fetch should succeed");
        assert_eq!(body, SCRIPT);

        let request = server.join().expect("server thread");
        assert!(request
            .to_ascii_lowercase()
            .contains(&format!("accept: {PAC_MIME_TYPE}")));
    }

    #[test]
    fn non_success_status_is_reported() {
        let (url, server) = serve_once("404 Not Found", "missing");
        let fetcher = HttpPacFetcher::new(Duration::from_secs(2), 1024);

        let err = fetcher.fetch(&url).expect_err("404 must fail");
        assert!(matches!(err, FetchError::Status(404)));
        server.join().expect("server thread");
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("big.pac");
        std::fs::write(&path, vec![b'x'; 64]).expect("write oversized script");
        let url = Url::from_file_path(&path).expect("file url");

        let err = HttpPacFetcher::new(Duration::from_secs(1), 32)
            .fetch(&url)
            .expect_err("oversized script must fail");
        assert!(matches!(err, FetchError::TooLarge { limit: 32 }));
    }

    #[test]
    fn reads_file_locations_and_rejects_other_schemes() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("proxy.pac");
        std::fs::write(&path, SCRIPT).expect("write script");
        let fetcher = HttpPacFetcher::default();

        let url = Url::from_file_path(&path).expect("file url");
        assert_eq!(fetcher.fetch(&url).expect("file fetch"), SCRIPT);

        let ftp = Url::parse("ftp://example.com/proxy.pac").expect("ftp url");
        assert!(matches!(
            fetcher.fetch(&ftp),
            Err(FetchError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }
}
