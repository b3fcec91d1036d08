use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rcgen::{BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use wicket::http::codec;
use wicket::{Config, Headers, HttpServer, HttpsServer, Request, Response, Router};

fn router() -> Router {
    let mut router = Router::new();
    router
        .get("/hello", |req: &mut Request, res: &mut Response| {
            let query = req.parse_query_string();
            let name = query.get("name").unwrap_or("world").to_owned();
            res.write_ok(format!("Hello, {name}!"), &Headers::new());
        })
        .unwrap()
        .post("/length", |req: &mut Request, res: &mut Response| {
            let size = req.content().size();
            res.write_ok(size.to_string(), &Headers::new());
        })
        .unwrap();
    router
}

fn config() -> Config {
    Config::new(0).address("127.0.0.1").runtime(Handle::current())
}

/// Reads one response with a Content-Length body and returns its body.
async fn read_body<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = BytesMut::new();
    let read = async {
        loop {
            if let Ok((line, headers, len)) = codec::parse_response_head(&buf) {
                assert_eq!(line.code, 200);
                let body_len: usize = headers.get("content-length").unwrap().parse().unwrap();
                while buf.len() < len + body_len {
                    assert!(stream.read_buf(&mut buf).await.unwrap() > 0);
                }
                return String::from_utf8(buf[len..len + body_len].to_vec()).unwrap();
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "eof before response");
        }
    };
    timeout(Duration::from_secs(5), read).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_alive_over_tcp() {
    let server = HttpServer::new(config(), router());
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /hello?name=first HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_body(&mut stream).await, "Hello, first!");

    stream
        .write_all(b"POST /length HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_body(&mut stream).await, "7");
    assert_eq!(server.connection_count(), 1);

    server.stop();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connections() {
    let server = HttpServer::new(config(), router());
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let request = format!("GET /hello?name=c{i} HTTP/1.1\r\nConnection: close\r\n\r\n");
                stream.write_all(request.as_bytes()).await.unwrap();
                read_body(&mut stream).await
            })
        })
        .collect();
    for (i, client) in clients.into_iter().enumerate() {
        assert_eq!(client.await.unwrap(), format!("Hello, c{i}!"));
    }
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_upload_still_reads_413() {
    let server = HttpServer::new(config().max_request_size(1024), router());
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut request = b"POST /length HTTP/1.1\r\nContent-Length: 65536\r\n\r\n".to_vec();
    request.resize(request.len() + 65536, b'x');
    stream.write_all(&request).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 413 "), "{response}");
    server.stop();
}

struct Pki {
    dir: tempfile::TempDir,
    ca: CertificateDer<'static>,
    client_cert: CertificateDer<'static>,
    client_key: Vec<u8>,
}

impl Pki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(vec!["client".to_string()]).unwrap();
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), ca.pem()).unwrap();
        std::fs::write(dir.path().join("server.pem"), server_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server.key"), server_key.serialize_pem()).unwrap();

        Self {
            dir,
            ca: ca.der().clone(),
            client_cert: client_cert.der().clone(),
            client_key: client_key.serialize_der(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn connector(&self, with_client_cert: bool) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.clone()).unwrap();
        let builder = ClientConfig::builder_with_provider(Arc::new(
            tokio_rustls::rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
        let config = if with_client_cert {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key.clone()));
            builder
                .with_client_auth_cert(vec![self.client_cert.clone()], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        TlsConnector::from(Arc::new(config))
    }
}

async fn https_get(connector: &TlsConnector, port: u16) -> std::io::Result<Vec<u8>> {
    let tcp = TcpStream::connect(("127.0.0.1", port)).await?;
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, tcp).await?;
    tls.write_all(b"GET /hello?name=tls HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    tls.read_to_end(&mut response).await?;
    Ok(response)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_https() {
    let pki = Pki::new();
    let server = HttpsServer::https(
        config(),
        router(),
        pki.path("server.pem"),
        pki.path("server.key"),
        None,
    )
    .unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let response = timeout(Duration::from_secs(5), https_get(&pki.connector(false), port))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("Hello, tls!"));
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_certificates_are_required_with_a_verify_file() {
    let pki = Pki::new();
    let ca = pki.path("ca.pem");
    let server = HttpsServer::https(
        config(),
        router(),
        pki.path("server.pem"),
        pki.path("server.key"),
        Some(ca.as_path()),
    )
    .unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let anonymous = timeout(Duration::from_secs(5), https_get(&pki.connector(false), port))
        .await
        .unwrap();
    assert!(!matches!(&anonymous, Ok(bytes) if !bytes.is_empty()));

    let verified = timeout(Duration::from_secs(5), https_get(&pki.connector(true), port))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8(verified).unwrap().ends_with("Hello, tls!"));
    server.stop();
}
