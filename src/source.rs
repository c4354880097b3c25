//! Byte ingress for the tools: a TCP endpoint or a file, read in blocks
//! and handed to the pump unchanged.

use std::fs::File;
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::warn;

/// Largest block read from the source in one go.
pub const TRANSFER_SIZE: usize = 4096;

/// Default trace-server port.
pub const DEFAULT_PORT: u16 = 3443;

/// Pause before re-dialling a source that went away.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Where the bytes come from.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    File(PathBuf),
}

/// Split a `host[:port]` argument, defaulting the port.
pub fn parse_server(s: &str) -> Endpoint {
    match s.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => Endpoint::Tcp {
                host: host.to_string(),
                port,
            },
            Err(_) => Endpoint::Tcp {
                host: s.to_string(),
                port: DEFAULT_PORT,
            },
        },
        None => Endpoint::Tcp {
            host: s.to_string(),
            port: DEFAULT_PORT,
        },
    }
}

/// An open connection to the endpoint.
pub enum SourceStream {
    Tcp(TcpStream),
    File(File),
}

impl SourceStream {
    /// Bound the time a read may block. File reads never do; only the
    /// TCP side carries the timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            SourceStream::Tcp(stream) => stream.set_read_timeout(timeout),
            SourceStream::File(_) => Ok(()),
        }
    }
}

impl Read for SourceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceStream::Tcp(stream) => stream.read(buf),
            SourceStream::File(file) => file.read(buf),
        }
    }
}

/// The tools' byte source with the end-of-source policy attached.
pub struct ByteSource {
    endpoint: Endpoint,

    /// Stop at end-of-source instead of waiting and re-dialling.
    end_terminate: bool,
}

impl ByteSource {
    pub fn new(endpoint: Endpoint, end_terminate: bool) -> Self {
        ByteSource {
            endpoint,
            end_terminate,
        }
    }

    /// Open one connection to the endpoint.
    pub fn open(&self) -> io::Result<SourceStream> {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                Ok(SourceStream::Tcp(TcpStream::connect((host.as_str(), *port))?))
            }
            Endpoint::File(path) => Ok(SourceStream::File(File::open(path)?)),
        }
    }

    /// Read blocks and pass them to `feed` until the source ends (and
    /// the policy says to stop) or `feed` asks to stop.
    ///
    /// The first connection failing is reported to the caller; once data
    /// has flowed, disconnects are retried with [`RETRY_BACKOFF`] unless
    /// terminating on end-of-source.
    pub fn run<F: FnMut(&[u8]) -> bool>(&self, mut feed: F) -> io::Result<()> {
        let mut first_attempt = true;

        loop {
            match self.open() {
                Ok(mut stream) => {
                    first_attempt = false;
                    let mut buf = [0u8; TRANSFER_SIZE];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                if !feed(&buf[..n]) {
                                    return Ok(());
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                warn!("source read failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) if first_attempt => return Err(e),
                Err(e) => warn!("source unavailable: {}", e),
            }

            if self.end_terminate {
                return Ok(());
            }
            thread::sleep(RETRY_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn server_argument_parsing() {
        match parse_server("localhost") {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, DEFAULT_PORT);
            }
            _ => panic!(),
        }

        match parse_server("box:4000") {
            Endpoint::Tcp { host, port } => {
                assert_eq!(host, "box");
                assert_eq!(port, 4000);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn file_source_runs_to_eof() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[1, 2, 3, 4, 5]).unwrap();

        let source = ByteSource::new(Endpoint::File(f.path().to_path_buf()), true);
        let mut seen = Vec::new();
        source
            .run(|block| {
                seen.extend_from_slice(block);
                true
            })
            .unwrap();

        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn tcp_source_delivers_the_stream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"trace bytes").unwrap();
        });

        let source = ByteSource::new(
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            true,
        );
        let mut seen = Vec::new();
        source
            .run(|block| {
                seen.extend_from_slice(block);
                true
            })
            .unwrap();

        server.join().unwrap();
        assert_eq!(seen, b"trace bytes");
    }

    #[test]
    fn missing_file_fails_up_front() {
        let source = ByteSource::new(Endpoint::File(PathBuf::from("/no/such/capture")), false);
        assert!(source.run(|_| true).is_err());
    }
}
