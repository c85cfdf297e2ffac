//! Reverse HTTP proxy in front of the application dev server.
//!
//! Everything is forwarded verbatim except `text/html` responses, which are
//! buffered, transparently decompressed, and given a bootstrap `<script>`
//! announcing the bus WebSocket URL. WebSocket upgrades (the dev server's
//! own HMR socket, typically) are tunnelled byte-for-byte.

use std::io::Read;

use anyhow::Context;
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::config::SharedConfig;

type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Headers that describe one hop, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub struct ReverseProxy {
    config: SharedConfig,
    client: reqwest::Client,
    shutdown_sender: watch::Sender<bool>,
}

impl ReverseProxy {
    pub fn new(config: SharedConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|source| ProxyError::Client { source })?;

        let (shutdown_sender, _) = watch::channel(false);
        Ok(ReverseProxy {
            config,
            client,
            shutdown_sender,
        })
    }

    /// Binds `(proxyHost, proxyPort)` and forwards until [`ReverseProxy::stop`].
    pub async fn serve(&self) -> Result<(), ProxyError> {
        let (host, port) = {
            let config = self.config.read().unwrap();
            (config.proxy_host.clone(), config.proxy_port)
        };

        let listener =
            TcpListener::bind((host.as_str(), port))
                .await
                .map_err(|source| ProxyError::Bind {
                    address: format!("{}:{}", host, port),
                    source,
                })?;

        log::info!("Reverse proxy listening on http://{}:{}", host, port);

        let mut shutdown = self.shutdown_sender.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::warn!("Proxy accept failed: {}", err);
                            continue;
                        }
                    };

                    let io = TokioIo::new(stream);
                    let config = self.config.clone();
                    let client = self.client.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |request: Request<Incoming>| {
                            let config = config.clone();
                            let client = client.clone();
                            async move {
                                Ok::<_, std::convert::Infallible>(
                                    handle_request(config, client, request).await,
                                )
                            }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            log::debug!("Error serving proxy connection: {}", err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Reverse proxy shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_sender.send(true);
    }
}

async fn handle_request(
    config: SharedConfig,
    client: reqwest::Client,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let result = if is_upgrade_request(&request) {
        proxy_upgrade(config, request).await
    } else {
        proxy_http(config, client, request).await
    };

    result.unwrap_or_else(|err| {
        log::warn!("Proxy request failed: {:#}", err);
        Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(full(Bytes::from(format!("Proxy error: {}", err))))
            .unwrap()
    })
}

fn is_upgrade_request(request: &Request<Incoming>) -> bool {
    request
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"))
}

async fn proxy_http(
    config: SharedConfig,
    client: reqwest::Client,
    request: Request<Incoming>,
) -> anyhow::Result<Response<ProxyBody>> {
    let (base_url, inject_at, ws_url) = {
        let config = config.read().unwrap();
        (
            config.server_base_url(),
            config.inject_at.clone(),
            config.ws_url(),
        )
    };

    let (parts, body) = request.into_parts();
    let body_bytes = body
        .collect()
        .await
        .context("Could not read request body")?
        .to_bytes();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", base_url, path_and_query);

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .context("Unsupported method")?;

    let mut upstream_request = client.request(method, &url);
    for (name, value) in parts.headers.iter() {
        let lowered = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lowered.as_str()) || lowered == "host" {
            continue;
        }
        upstream_request = upstream_request.header(name.as_str(), value.as_bytes());
    }

    let upstream = upstream_request
        .body(body_bytes.to_vec())
        .send()
        .await
        .context("Upstream request failed")?;

    let status = StatusCode::from_u16(upstream.status().as_u16())?;
    let headers: Vec<(String, Vec<u8>)> = upstream
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
        .collect();

    let is_html = upstream
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));

    if is_html {
        let encoding = upstream
            .headers()
            .get("content-encoding")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase());

        let raw = upstream.bytes().await.context("Could not read HTML body")?;
        let decompressed = decompress(&raw, encoding.as_deref())?;
        let html = String::from_utf8_lossy(&decompressed).into_owned();
        let rewritten = inject_bootstrap_script(&html, &inject_at, &ws_url);

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if HOP_BY_HOP.contains(&name.as_str())
                || name == "content-encoding"
                || name == "content-length"
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_slice());
        }

        return Ok(builder.body(full(Bytes::from(rewritten)))?);
    }

    // Anything that isn't HTML streams through untouched, compression and
    // all.
    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_slice());
    }

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|err| std::io::Error::other(err.to_string()));
    Ok(builder.body(StreamBody::new(stream).boxed_unsync())?)
}

/// Tunnels a WebSocket (or any other) upgrade by pairing the client-side and
/// upstream-side upgrade futures with a bidirectional copy.
async fn proxy_upgrade(
    config: SharedConfig,
    mut request: Request<Incoming>,
) -> anyhow::Result<Response<ProxyBody>> {
    let (host, port) = {
        let config = config.read().unwrap();
        (config.server_host.clone(), config.server_port)
    };

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .context("Could not reach upstream for upgrade")?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("Upstream handshake failed")?;
    tokio::spawn(connection.with_upgrades());

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_owned();

    let mut forward_builder = Request::builder()
        .method(request.method().clone())
        .uri(path_and_query);
    for (name, value) in request.headers().iter() {
        if name == header::HOST {
            continue;
        }
        forward_builder = forward_builder.header(name, value);
    }
    forward_builder = forward_builder.header(header::HOST, format!("{}:{}", host, port));
    let forward_request = forward_builder.body(Empty::<Bytes>::new())?;

    let mut upstream_response = sender
        .send_request(forward_request)
        .await
        .context("Upstream upgrade request failed")?;

    if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = upstream_response.into_parts();
        let bytes = body.collect().await?.to_bytes();
        let mut builder = Response::builder().status(parts.status);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        return Ok(builder.body(full(bytes))?);
    }

    let client_upgrade = hyper::upgrade::on(&mut request);
    let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client_io, upstream_io)) => {
                let mut client_io = TokioIo::new(client_io);
                let mut upstream_io = TokioIo::new(upstream_io);
                if let Err(err) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                {
                    log::debug!("Upgrade tunnel closed: {}", err);
                }
            }
            Err(err) => log::debug!("Upgrade pairing failed: {}", err),
        }
    });

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream_response.headers().iter() {
        builder = builder.header(name, value);
    }
    Ok(builder.body(empty())?)
}

/// Inserts the bus bootstrap script immediately before the anchor.
///
/// Injection is skipped when the body doesn't look like a full document
/// (missing `<html` or `<head`) or when the anchor never occurs.
pub(crate) fn inject_bootstrap_script(html: &str, anchor: &str, ws_url: &str) -> String {
    if !html.contains("<html") || !html.contains("<head") {
        return html.to_owned();
    }

    let Some(index) = html.find(anchor) else {
        return html.to_owned();
    };

    let script = format!(
        "<script>\n  window.__JSX_TOOL_DEV_SERVER_WS_URL__ = '{}';\n</script>\n",
        ws_url
    );

    let mut rewritten = String::with_capacity(html.len() + script.len());
    rewritten.push_str(&html[..index]);
    rewritten.push_str(&script);
    rewritten.push_str(&html[index..]);
    rewritten
}

/// Inflates a body according to its `content-encoding`. Unknown encodings
/// pass through untouched.
pub(crate) fn decompress(raw: &[u8], encoding: Option<&str>) -> anyhow::Result<Vec<u8>> {
    match encoding {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(raw)
                .read_to_end(&mut out)
                .context("Could not inflate gzip body")?;
            Ok(out)
        }
        Some("deflate") => {
            // Servers disagree on whether "deflate" means zlib-wrapped or
            // raw; try the common form first.
            let mut out = Vec::new();
            if flate2::read::ZlibDecoder::new(raw)
                .read_to_end(&mut out)
                .is_ok()
            {
                return Ok(out);
            }
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(raw)
                .read_to_end(&mut out)
                .context("Could not inflate deflate body")?;
            Ok(out)
        }
        Some("br") => {
            let mut out = Vec::new();
            brotli::Decompressor::new(raw, 4096)
                .read_to_end(&mut out)
                .context("Could not inflate brotli body")?;
            Ok(out)
        }
        Some("identity") | None => Ok(raw.to_vec()),
        Some(other) => {
            log::debug!("Passing through unknown content-encoding '{}'", other);
            Ok(raw.to_vec())
        }
    }
}

fn full(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Could not bind the proxy at {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not build the proxy HTTP client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    const WS_URL: &str = "ws://localhost:12021";

    #[test]
    fn injects_before_the_anchor() {
        let html = "<!DOCTYPE html><html><head><title>t</title></head><body/></html>";
        let rewritten = inject_bootstrap_script(html, "</head>", WS_URL);

        let script_at = rewritten
            .find("window.__JSX_TOOL_DEV_SERVER_WS_URL__ = 'ws://localhost:12021';")
            .expect("script missing");
        let head_close_at = rewritten.find("</head>").unwrap();
        assert!(script_at < head_close_at);

        // Everything else survives.
        assert!(rewritten.contains("<title>t</title>"));
        assert!(rewritten.ends_with("</html>"));
    }

    #[test]
    fn skips_fragments_without_html_and_head() {
        let fragment = "<div>partial</div></head>";
        assert_eq!(
            inject_bootstrap_script(fragment, "</head>", WS_URL),
            fragment
        );
    }

    #[test]
    fn missing_anchor_leaves_body_unchanged() {
        let html = "<html><head></head><body></body></html>";
        assert_eq!(inject_bootstrap_script(html, "<!--nope-->", WS_URL), html);
    }

    #[test]
    fn gzip_bodies_decompress_and_inject() {
        let html = "<!DOCTYPE html><html><head><title>t</title></head><body/></html>";
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(html.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = decompress(&compressed, Some("gzip")).unwrap();
        assert_eq!(decompressed, html.as_bytes());

        let rewritten =
            inject_bootstrap_script(&String::from_utf8(decompressed).unwrap(), "</head>", WS_URL);
        assert!(rewritten.contains("window.__JSX_TOOL_DEV_SERVER_WS_URL__"));
    }

    #[test]
    fn deflate_and_brotli_bodies_decompress() {
        let body = b"<html><head></head></html>";

        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(body).unwrap();
        let deflated = encoder.finish().unwrap();
        assert_eq!(decompress(&deflated, Some("deflate")).unwrap(), body);

        let mut brotlied = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut brotlied, 4096, 5, 22);
            writer.write_all(body).unwrap();
        }
        assert_eq!(decompress(&brotlied, Some("br")).unwrap(), body);
    }

    #[test]
    fn identity_and_unknown_encodings_pass_through() {
        let body = b"plain";
        assert_eq!(decompress(body, None).unwrap(), body);
        assert_eq!(decompress(body, Some("zstd")).unwrap(), body);
    }

    #[tokio::test]
    async fn proxies_and_injects_gzip_html_end_to_end() {
        use std::convert::Infallible;

        // Upstream dev server stand-in: always answers gzip-encoded HTML.
        let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = upstream.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|_request: Request<Incoming>| async {
                        let html =
                            "<!DOCTYPE html><html><head><title>t</title></head><body/></html>";
                        let mut encoder = flate2::write::GzEncoder::new(
                            Vec::new(),
                            flate2::Compression::default(),
                        );
                        encoder.write_all(html.as_bytes()).unwrap();
                        let compressed = encoder.finish().unwrap();

                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", "text/html; charset=utf-8")
                                .header("content-encoding", "gzip")
                                .header("content-length", compressed.len().to_string())
                                .body(Full::new(Bytes::from(compressed)))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let proxy_port = {
            let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut config = crate::Config::defaults(std::env::temp_dir());
        config.server_host = "127.0.0.1".to_owned();
        config.server_port = upstream_port;
        config.proxy_host = "127.0.0.1".to_owned();
        config.proxy_port = proxy_port;
        let config = crate::config::shared(config);

        let proxy = std::sync::Arc::new(ReverseProxy::new(config).unwrap());
        let serving = std::sync::Arc::clone(&proxy);
        tokio::spawn(async move {
            let _ = serving.serve().await;
        });
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", proxy_port)).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let response = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/", proxy_port))
            .send()
            .await
            .unwrap();

        assert!(response.headers().get("content-encoding").is_none());

        let body = response.text().await.unwrap();
        let script_at = body
            .find("window.__JSX_TOOL_DEV_SERVER_WS_URL__ = 'ws://localhost:12021';")
            .expect("bootstrap script missing");
        assert!(script_at < body.find("</head>").unwrap());

        proxy.stop();
    }
}
