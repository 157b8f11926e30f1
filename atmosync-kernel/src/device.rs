//! Device wire protocol - sensing poll and liveness probe
//!
//! Both calls are plain `POST http://<address>/` with a `text/plain` body:
//! - `SENSE <unix-ts>` → `<device-name> <token> <float>C <float>%RH`
//! - `ECHO XYZ`       → any non-empty body means the device is alive

use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

pub const ECHO_REQUEST: &str = "ECHO XYZ";

/// Parsed answer to a `SENSE` request
#[derive(Debug, Clone, PartialEq)]
pub struct SenseReport {
    /// Name reported by the device itself; authoritative for the stored reading
    pub device: String,
    pub token: String,
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("expected 4 tokens, got {0}")]
    TokenCount(usize),
    #[error("temperature token {0:?} has no 'C' unit")]
    MissingCelsius(String),
    #[error("humidity token {0:?} has no '%RH' unit")]
    MissingHumidity(String),
    #[error("invalid number in {0:?}")]
    InvalidNumber(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device answered HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(#[from] ParseError),
    #[error("empty echo response")]
    EmptyEcho,
}

pub fn sense_request(at: OffsetDateTime) -> String {
    format!("SENSE {}", at.unix_timestamp())
}

/// Grammar: `name token temperature"C" humidity"%RH"`, whitespace separated.
pub fn parse_sense_response(body: &str) -> Result<SenseReport, ParseError> {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    let [device, token, temperature, humidity] = tokens.as_slice() else {
        return Err(ParseError::TokenCount(tokens.len()));
    };

    let temperature_num = temperature
        .strip_suffix('C')
        .ok_or_else(|| ParseError::MissingCelsius(temperature.to_string()))?;
    let humidity_num = humidity
        .strip_suffix("%RH")
        .ok_or_else(|| ParseError::MissingHumidity(humidity.to_string()))?;

    Ok(SenseReport {
        device: device.to_string(),
        token: token.to_string(),
        temperature: parse_measure(temperature_num, temperature)?,
        humidity: parse_measure(humidity_num, humidity)?,
    })
}

fn parse_measure(num: &str, token: &str) -> Result<f64, ParseError> {
    match num.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidNumber(token.to_string())),
    }
}

fn device_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}/", address)
    }
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn sense(&self, address: &str, at: OffsetDateTime) -> Result<SenseReport, DeviceError>;

    /// Returns the raw echo body; empty bodies are reported as `EmptyEcho`
    async fn echo(&self, address: &str) -> Result<String, DeviceError>;
}

/// reqwest-backed client used in production
#[derive(Clone)]
pub struct HttpDeviceClient {
    http: reqwest::Client,
    sense_timeout: Duration,
    echo_timeout: Duration,
}

impl HttpDeviceClient {
    pub fn new(sense_timeout: Duration, echo_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            sense_timeout,
            echo_timeout,
        }
    }

    async fn post_text(&self, address: &str, body: String, timeout: Duration) -> Result<String, DeviceError> {
        let response = self
            .http
            .post(device_url(address))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16()));
        }

        response.text().await.map_err(|e| transport_error(e, timeout))
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> DeviceError {
    if e.is_timeout() {
        DeviceError::Timeout(timeout)
    } else {
        DeviceError::Transport(e.to_string())
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn sense(&self, address: &str, at: OffsetDateTime) -> Result<SenseReport, DeviceError> {
        let body = self.post_text(address, sense_request(at), self.sense_timeout).await?;
        Ok(parse_sense_response(&body)?)
    }

    async fn echo(&self, address: &str) -> Result<String, DeviceError> {
        let body = self
            .post_text(address, ECHO_REQUEST.to_string(), self.echo_timeout)
            .await?;
        if body.is_empty() {
            return Err(DeviceError::EmptyEcho);
        }
        Ok(body)
    }
}
