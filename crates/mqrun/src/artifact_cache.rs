use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;

use crate::config::TlsPolicy;
use crate::download_progress::ProgressLine;
use crate::file_lock::FileLock;
use crate::supervisor_support::now_unix_ms;

/// Local name of the artifact: the last non-empty segment of the URL path.
pub fn artifact_file_name(source_url: &str) -> anyhow::Result<String> {
    let url = Url::parse(source_url).with_context(|| format!("parse artifact url {source_url}"))?;
    let name = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("artifact url has no file name: {source_url}"))?;
    if name == "." || name == ".." {
        anyhow::bail!("artifact url has no usable file name: {source_url}");
    }
    Ok(name)
}

fn http_client(tls: TlsPolicy) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("mqrun/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(15 * 60));
    if tls == TlsPolicy::NoVerify {
        tracing::warn!("TLS certificate verification disabled for artifact download");
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().context("build http client")
}

#[derive(Debug, Clone, serde::Serialize)]
struct ArtifactMeta<'a> {
    url: &'a str,
    size_bytes: u64,
    downloaded_at_unix_ms: u64,
}

fn write_meta_best_effort(artifact: &Path, url: &str, size_bytes: u64) {
    let meta = ArtifactMeta {
        url,
        size_bytes,
        downloaded_at_unix_ms: now_unix_ms(),
    };
    let mut name = artifact.as_os_str().to_owned();
    name.push(".meta.json");
    let path = PathBuf::from(name);
    let Ok(json) = serde_json::to_vec_pretty(&meta) else {
        return;
    };
    if let Err(e) = fs::write(&path, json) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write artifact meta");
    }
}

/// Returns `<cache_dir>/<artifact name>`, downloading it on first use.
///
/// A file already present under that name is trusted as-is. Downloads land in
/// `<name>.part` and are renamed only once the body was fully written, so an
/// interrupted transfer never poses as a cached artifact. `<name>.lock` is held
/// from the cache check to the rename; a caller that waited on it finds the
/// finished file instead of downloading again.
pub async fn ensure(source_url: &str, cache_dir: &Path, tls: TlsPolicy) -> anyhow::Result<PathBuf> {
    if !cache_dir.is_dir() {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("create cache dir {}", cache_dir.display()))?;
    }

    let file_name = artifact_file_name(source_url)?;
    let artifact = cache_dir.join(&file_name);
    if artifact.is_file() {
        tracing::debug!(path = %artifact.display(), "artifact cache hit");
        return Ok(artifact);
    }

    let _lock = FileLock::acquire_async(&cache_dir.join(format!("{file_name}.lock"))).await?;
    if artifact.is_file() {
        tracing::debug!(path = %artifact.display(), "artifact downloaded by another caller");
        return Ok(artifact);
    }

    let part = cache_dir.join(format!("{file_name}.part"));
    match download_to(source_url, &artifact, &part, tls).await {
        Ok(size) => {
            write_meta_best_effort(&artifact, source_url, size);
            Ok(artifact)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

async fn download_to(
    source_url: &str,
    artifact: &Path,
    part: &Path,
    tls: TlsPolicy,
) -> anyhow::Result<u64> {
    let url = Url::parse(source_url)?;
    let resp = http_client(tls)?
        .get(url)
        .send()
        .await
        .with_context(|| format!("download {source_url}"))?
        .error_for_status()
        .with_context(|| format!("download {source_url} (status)"))?;

    let total_bytes = resp.content_length();
    match total_bytes {
        Some(total) => println!("Downloading: {} Bytes: {total}", artifact.display()),
        None => println!("Downloading: {} Bytes: unknown", artifact.display()),
    }
    tracing::info!(url = %source_url, ?total_bytes, "downloading artifact");

    let mut f = tokio::fs::File::create(part)
        .await
        .with_context(|| format!("create {}", part.display()))?;
    let mut progress = ProgressLine::stdout(total_bytes);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("read body of {source_url}"))?;
        f.write_all(&chunk)
            .await
            .with_context(|| format!("write {}", part.display()))?;
        progress.advance(chunk.len());
    }
    f.flush().await?;
    f.sync_all().await?;
    drop(f);

    let downloaded = progress.downloaded_bytes();
    tracing::debug!(downloaded, redraws = progress.redraws(), "artifact body complete");
    progress.finish();

    tokio::fs::rename(part, artifact)
        .await
        .with_context(|| format!("move {} into place", part.display()))?;
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
    use tokio::net::TcpListener;

    use super::*;
    use crate::supervisor_support::temp_dir_for;

    /// Splits the response into `chunk`-byte writes with `gap` between them.
    #[derive(Clone, Copy)]
    struct Pacing {
        chunk: usize,
        gap: Duration,
    }

    async fn respond<S>(mut sock: S, response: &[u8], pacing: Option<Pacing>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        match pacing {
            None => {
                let _ = sock.write_all(response).await;
            }
            Some(p) => {
                for piece in response.chunks(p.chunk) {
                    if sock.write_all(piece).await.is_err() {
                        return;
                    }
                    let _ = sock.flush().await;
                    tokio::time::sleep(p.gap).await;
                }
            }
        }
        let _ = sock.shutdown().await;
    }

    /// Serves canned HTTP/1.1 responses on loopback and counts connections.
    async fn serve_paced(response: Vec<u8>, pacing: Option<Pacing>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let response = Arc::new(response);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                tokio::spawn(async move { respond(sock, &response, pacing).await });
            }
        });
        (port, hits)
    }

    async fn serve(response: Vec<u8>) -> (u16, Arc<AtomicUsize>) {
        serve_paced(response, None).await
    }

    /// Same as `serve`, behind TLS with a freshly generated self-signed cert.
    async fn serve_tls(response: Vec<u8>) -> (u16, Arc<AtomicUsize>) {
        use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer};

        let certified = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let response = Arc::new(response);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    // Clients that reject the certificate abort the handshake here.
                    if let Ok(tls) = acceptor.accept(sock).await {
                        respond(tls, &response, None).await;
                    }
                });
            }
        });
        (port, hits)
    }

    fn ok_response(body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn file_name_is_last_path_segment() {
        assert_eq!(
            artifact_file_name("https://example.test/app-1.0.0.jar").unwrap(),
            "app-1.0.0.jar"
        );
        assert_eq!(
            artifact_file_name(
                "https://s3-eu-west-1.amazonaws.com/softwaremill-public/elasticmq-server-1.4.2.jar"
            )
            .unwrap(),
            "elasticmq-server-1.4.2.jar"
        );
        assert_eq!(
            artifact_file_name("https://example.test/dist/app.jar/").unwrap(),
            "app.jar"
        );
        assert!(artifact_file_name("https://example.test/").is_err());
        assert!(artifact_file_name("not a url").is_err());
    }

    #[tokio::test]
    async fn second_ensure_is_served_from_cache() {
        let body = vec![7u8; 20_000];
        let (port, hits) = serve(ok_response(&body)).await;
        let root = temp_dir_for("cache-hit");
        let cache = root.join(".cache");
        let url = format!("http://127.0.0.1:{port}/app-1.0.0.jar");

        let first = ensure(&url, &cache, TlsPolicy::Verify).await.unwrap();
        assert_eq!(first, cache.join("app-1.0.0.jar"));
        assert_eq!(fs::read(&first).unwrap(), body);
        assert!(cache.join("app-1.0.0.jar.meta.json").is_file());
        assert!(!cache.join("app-1.0.0.jar.part").exists());

        let second = ensure(&url, &cache, TlsPolicy::Verify).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn existing_file_is_trusted_without_network() {
        let root = temp_dir_for("cache-preseeded");
        let cache = root.join(".cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("app-1.0.0.jar"), b"stub").unwrap();

        // Nothing listens on example.test; a network attempt would fail.
        let path = ensure("https://example.test/app-1.0.0.jar", &cache, TlsPolicy::Verify)
            .await
            .unwrap();
        assert_eq!(path, cache.join("app-1.0.0.jar"));

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn http_error_leaves_no_file_behind() {
        let (port, _) =
            serve(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec())
                .await;
        let root = temp_dir_for("cache-404");
        let cache = root.join(".cache");
        let url = format!("http://127.0.0.1:{port}/missing.jar");

        let err = ensure(&url, &cache, TlsPolicy::Verify).await.unwrap_err();
        assert!(format!("{err:#}").contains("status"));
        assert!(!cache.join("missing.jar").exists());
        assert!(!cache.join("missing.jar.part").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn truncated_body_is_not_cached() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&[1u8; 100]);
        let (port, hits) = serve(response).await;
        let root = temp_dir_for("cache-truncated");
        let cache = root.join(".cache");
        let url = format!("http://127.0.0.1:{port}/app.jar");

        assert!(ensure(&url, &cache, TlsPolicy::Verify).await.is_err());
        assert!(!cache.join("app.jar").exists());
        assert!(!cache.join("app.jar.part").exists());

        // The failed transfer is retried on the next call rather than served.
        assert!(ensure(&url, &cache, TlsPolicy::Verify).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn overlapping_first_downloads_share_one_transfer() {
        let body = vec![0xABu8; 10_000];
        let pacing = Pacing {
            chunk: 1000,
            gap: Duration::from_millis(30),
        };
        let (port, hits) = serve_paced(ok_response(&body), Some(pacing)).await;
        let root = temp_dir_for("cache-overlap");
        let cache = root.join(".cache");
        let url = format!("http://127.0.0.1:{port}/app.jar");

        let first = ensure(&url, &cache, TlsPolicy::Verify);
        let second = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ensure(&url, &cache, TlsPolicy::Verify).await
        };
        let (first, second) = tokio::join!(first, second);

        let first = first.unwrap();
        assert_eq!(second.unwrap(), first);
        assert_eq!(fs::read(&first).unwrap(), body);
        assert!(!cache.join("app.jar.part").exists());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn strict_tls_rejects_self_signed_certificate() {
        let (port, _) = serve_tls(ok_response(b"jar")).await;
        let root = temp_dir_for("cache-tls-verify");
        let cache = root.join(".cache");
        let url = format!("https://127.0.0.1:{port}/app.jar");

        let err = ensure(&url, &cache, TlsPolicy::Verify).await.unwrap_err();
        assert!(format!("{err:#}").contains("download"));
        assert!(!cache.join("app.jar").exists());
        assert!(!cache.join("app.jar.part").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn noverify_accepts_self_signed_certificate() {
        let (port, hits) = serve_tls(ok_response(b"jar-bytes")).await;
        let root = temp_dir_for("cache-tls-noverify");
        let cache = root.join(".cache");
        let url = format!("https://127.0.0.1:{port}/app.jar");

        let path = ensure(&url, &cache, TlsPolicy::NoVerify).await.unwrap();
        assert_eq!(path, cache.join("app.jar"));
        assert_eq!(fs::read(&path).unwrap(), b"jar-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let _ = fs::remove_dir_all(&root);
    }
}
