//! Bootstrap HTTP client for fetching CRLs and talking to an ACME directory
//! without depending on this process's own TLS verification (adapted
//! directly from the teacher's `tls::bootstrap_client`).

use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use rustls::{ClientConfig, RootCertStore};

#[derive(Clone)]
pub struct BootstrapHttpClient {
    client: Client<HttpsConnector<HttpConnector>, String>,
}

impl BootstrapHttpClient {
    pub fn new() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let https_connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(hyper_util::rt::TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https_connector);

        Self { client }
    }

    pub async fn execute(
        &self,
        request: Request<String>,
    ) -> Result<Response<Incoming>, Box<dyn std::error::Error + Send + Sync>> {
        self.client.request(request).await.map_err(Into::into)
    }

    pub fn get(url: &str) -> Result<Request<String>, Box<dyn std::error::Error + Send + Sync>> {
        Request::builder()
            .method("GET")
            .uri(url)
            .header("User-Agent", "keymgr-bootstrap/1.0")
            .body(String::new())
            .map_err(Into::into)
    }

    pub fn post(url: &str, body: String, content_type: &str) -> Result<Request<String>, Box<dyn std::error::Error + Send + Sync>> {
        Request::builder()
            .method("POST")
            .uri(url)
            .header("User-Agent", "keymgr-bootstrap/1.0")
            .header("Content-Type", content_type)
            .body(body)
            .map_err(Into::into)
    }
}

impl Default for BootstrapHttpClient {
    fn default() -> Self {
        Self::new()
    }
}
