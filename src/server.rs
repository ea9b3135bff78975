//! Health endpoint
//!
//! A minimal HTTP(S) surface on `--server-address`: `/healthz` answers
//! `ok` once the controller is up. TLS is enabled when both a certificate
//! and a private key are configured.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Error;

fn router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Serve the health endpoint until cancelled.
///
/// Bind failures surface as errors; in-flight serve failures are logged
/// and end the task.
pub async fn serve(
    addr: SocketAddr,
    tls_cert_file: Option<&str>,
    tls_private_key_file: Option<&str>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let app = router().into_make_service();
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.shutdown();
        });
    }

    match (tls_cert_file, tls_private_key_file) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::startup(format!("failed to load TLS material: {e}")))?;
            info!(addr = %addr, "serving https health endpoint");
            if let Err(e) = axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await
            {
                error!(error = %e, "health server error");
            }
        }
        _ => {
            info!(addr = %addr, "serving http health endpoint");
            if let Err(e) = axum_server::bind(addr).handle(handle).serve(app).await {
                error!(error = %e, "health server error");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_answers_ok() {
        use tower::util::ServiceExt;

        let app = router();
        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/healthz")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }
}
