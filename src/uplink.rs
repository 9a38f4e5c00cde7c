use std::{sync::Arc, time::Duration, time::SystemTime};

use anyhow::Context as ErrorContext;
use async_trait::async_trait;
use hyper::{
    client::HttpConnector, header::CONTENT_TYPE, Body, Client, Method, Request, Uri,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use log::{error, info, warn};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, ServerName,
};
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::UplinkConfig;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("{0}")]
    Http(#[from] hyper::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait HttpTransport {
    /// POST a form encoded body to the endpoint.
    async fn post_form(&self, body: String) -> Result<HttpResponse, TransportError>;
}

/// Encode a barcode as the `barcode=<value>` form body.
pub fn form_body(barcode: &str) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("barcode", barcode)
        .finish()
}

/// Accepts every server certificate.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>>,
    endpoint: Uri,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint: Uri = endpoint.parse().context("invalid endpoint url")?;

        let tls = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        info!("https client setup for {endpoint}");

        Ok(HyperTransport {
            client: Client::builder().build(https),
            endpoint,
            timeout,
        })
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn post_form(&self, body: String) -> Result<HttpResponse, TransportError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(Body::from(body))?;

        let exchange = async {
            let resp = self.client.request(request).await?;
            let status = resp.status().as_u16();
            let body = hyper::body::to_bytes(resp.into_body()).await?;
            Ok::<_, TransportError>(HttpResponse {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        };

        timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }
}

#[derive(Debug)]
pub enum Outcome {
    Delivered(HttpResponse),
    /// Only produced with strict status checking.
    Rejected(HttpResponse),
    Failed(TransportError),
}

#[derive(Debug)]
pub struct DeliveryAttempt {
    pub attempt: u32,
    pub outcome: Outcome,
}

/// What happened to one barcode, kept only for logging.
#[derive(Debug)]
pub struct Delivery {
    pub barcode: String,
    pub attempts: Vec<DeliveryAttempt>,
}

impl Delivery {
    pub fn delivered(&self) -> bool {
        matches!(
            self.attempts.last(),
            Some(DeliveryAttempt {
                outcome: Outcome::Delivered(_),
                ..
            })
        )
    }
}

pub struct DeliveryPipeline<T> {
    transport: T,
    max_attempts: u32,
    backoff: Duration,
    strict_status: bool,
}

impl DeliveryPipeline<HyperTransport> {
    pub fn from_config(cfg: &UplinkConfig) -> anyhow::Result<Self> {
        let transport = HyperTransport::new(&cfg.endpoint, cfg.timeout())?;
        Ok(DeliveryPipeline::new(transport, cfg))
    }
}

impl<T: HttpTransport> DeliveryPipeline<T> {
    pub fn new(transport: T, cfg: &UplinkConfig) -> Self {
        DeliveryPipeline {
            transport,
            max_attempts: cfg.max_attempts,
            backoff: cfg.backoff(),
            strict_status: cfg.strict_status,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn accepts(&self, status: u16) -> bool {
        status > 0 && (!self.strict_status || (200..300).contains(&status))
    }

    /// Try to hand a barcode to the endpoint.
    ///
    /// Any HTTP response counts as delivered unless strict status checking is
    /// on. Failed attempt `k` is followed by a `k * backoff` pause. Giving up
    /// is only logged.
    pub async fn deliver(&self, barcode: &str) -> Delivery {
        let body = form_body(barcode);
        let mut attempts = Vec::new();

        for attempt in 1..=self.max_attempts {
            let outcome = match self.transport.post_form(body.clone()).await {
                Ok(resp) if self.accepts(resp.status) => {
                    info!("HTTP POST successful, response code: {}", resp.status);
                    if !(200..300).contains(&resp.status) {
                        warn!(
                            "endpoint answered with status {}, counted as delivered",
                            resp.status
                        );
                    }
                    info!("response: {}", resp.body);
                    attempts.push(DeliveryAttempt {
                        attempt,
                        outcome: Outcome::Delivered(resp),
                    });
                    return Delivery {
                        barcode: barcode.to_string(),
                        attempts,
                    };
                }
                Ok(resp) => {
                    warn!(
                        "HTTP POST rejected, response code: {}, response: {}",
                        resp.status, resp.body
                    );
                    Outcome::Rejected(resp)
                }
                Err(e) => {
                    error!(
                        "HTTP POST failed (attempt {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    Outcome::Failed(e)
                }
            };
            attempts.push(DeliveryAttempt { attempt, outcome });
            sleep(self.backoff * attempt).await;
        }

        warn!(
            "giving up on barcode {:?} after {} attempts",
            barcode, self.max_attempts
        );
        Delivery {
            barcode: barcode.to_string(),
            attempts,
        }
    }
}
