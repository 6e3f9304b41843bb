use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::http_utils::read_until_double_crlf;

#[derive(Clone)]
enum UpstreamBehavior {
    Echo,
    HttpResponse { response: Arc<Vec<u8>> },
}

/// Local origin server that counts the requests it receives.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    request_heads: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn echo() -> Result<Self> {
        Self::spawn(UpstreamBehavior::Echo).await
    }

    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into()),
        })
        .await
    }

    /// `200 OK` with `body`, a matching `Content-Length` and the extra
    /// header lines in `headers` (each terminated by `\r\n`).
    pub async fn http_ok(headers: &str, body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{headers}Connection: close\r\n\r\n{body}",
            body.len(),
        );
        Self::http_response(response.into_bytes()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn request_heads(&self) -> Vec<String> {
        self.request_heads.lock().clone()
    }

    async fn spawn(behavior: UpstreamBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let request_heads = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let requests = requests.clone();
            let request_heads = request_heads.clone();
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let behavior = behavior.clone();
                    let requests = requests.clone();
                    let request_heads = request_heads.clone();
                    tokio::spawn(async move {
                        let _ =
                            handle_connection(&mut stream, behavior, requests, request_heads)
                                .await;
                    });
                }
            })
        };
        Ok(Self {
            addr,
            requests,
            request_heads,
            handle,
        })
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    behavior: UpstreamBehavior,
    requests: Arc<AtomicUsize>,
    request_heads: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    match behavior {
        UpstreamBehavior::Echo => {
            requests.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        UpstreamBehavior::HttpResponse { response } => {
            let head = read_until_double_crlf(stream).await?;
            if head.is_empty() {
                return Ok(());
            }
            request_heads.lock().push(head);
            requests.fetch_add(1, Ordering::SeqCst);
            let _ = stream.write_all(&response).await;
            stream.shutdown().await.ok();
        }
    }
    Ok(())
}
