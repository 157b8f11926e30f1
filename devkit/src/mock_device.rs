/*!
Capteur simulé pour développement sans matériel

Démarre un petit serveur HTTP local qui répond comme un capteur AtmoSync:
- `SENSE <ts>` -> `<nom> <ts> <t>C <h>%RH`
- `ECHO XYZ`   -> `ECHO-OK`

Le comportement est modifiable à chaud pour simuler les pannes réseau.
Toutes les requêtes reçues sont enregistrées pour les assertions de tests.
*/

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Comportement du capteur simulé
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Réponses conformes au protocole
    Healthy,
    /// Corps de réponse arbitraire (SENSE et ECHO)
    Malformed(String),
    /// Répond normalement après un délai
    Delay(Duration),
    /// Code HTTP d'erreur
    HttpError(u16),
    /// 200 avec un corps vide
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Sense,
    Echo,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub kind: RequestKind,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

struct DeviceState {
    reported_name: String,
    temperature: f64,
    humidity: f64,
    behavior: Behavior,
    requests: Vec<RecordedRequest>,
}

/// Capteur HTTP simulé ; le serveur s'arrête quand la valeur est droppée
pub struct MockDevice {
    name: String,
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    server: JoinHandle<()>,
}

impl MockDevice {
    /// Démarre un capteur sur 127.0.0.1 avec un port libre
    pub async fn start(name: &str) -> Result<Self> {
        let state = Arc::new(Mutex::new(DeviceState {
            reported_name: name.to_string(),
            temperature: 22.0,
            humidity: 45.0,
            behavior: Behavior::Healthy,
            requests: Vec::new(),
        }));

        let app = Router::new()
            .route("/", post(handle_request))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("mock device server stopped: {}", e);
            }
        });

        log::info!("🌡️ [MOCK] device {} listening on {}", name, addr);
        Ok(Self {
            name: name.to_string(),
            addr,
            state,
            server,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adresse au format attendu par le registre (`ip:port`)
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        log::info!("🔧 [MOCK] {} -> {:?}", self.name, behavior);
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn set_reading(&self, temperature: f64, humidity: f64) {
        let mut state = self.state.lock().unwrap();
        state.temperature = temperature;
        state.humidity = humidity;
    }

    /// Nom renvoyé dans la réponse SENSE (peut différer du nom enregistré)
    pub fn set_reported_name(&self, name: &str) {
        self.state.lock().unwrap().reported_name = name.to_string();
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().requests.clear();
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn classify(body: &str) -> RequestKind {
    match body.split_whitespace().next() {
        Some("SENSE") => RequestKind::Sense,
        Some("ECHO") => RequestKind::Echo,
        _ => RequestKind::Unknown,
    }
}

async fn handle_request(State(state): State<Arc<Mutex<DeviceState>>>, body: String) -> Response {
    let kind = classify(&body);

    // snapshot sous verrou, jamais tenu pendant le délai
    let (behavior, reported_name, temperature, humidity) = {
        let mut st = state.lock().unwrap();
        st.requests.push(RecordedRequest {
            kind,
            body: body.clone(),
            received_at: Utc::now(),
        });
        (st.behavior.clone(), st.reported_name.clone(), st.temperature, st.humidity)
    };

    match behavior {
        Behavior::Malformed(text) => return (StatusCode::OK, text).into_response(),
        Behavior::HttpError(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, "device error").into_response();
        }
        Behavior::Empty => return (StatusCode::OK, String::new()).into_response(),
        Behavior::Delay(delay) => tokio::time::sleep(delay).await,
        Behavior::Healthy => {}
    }

    match kind {
        RequestKind::Sense => {
            let token = body.split_whitespace().nth(1).unwrap_or("0");
            let text = format!("{} {} {:.1}C {:.1}%RH", reported_name, token, temperature, humidity);
            (StatusCode::OK, text).into_response()
        }
        RequestKind::Echo => (StatusCode::OK, "ECHO-OK").into_response(),
        RequestKind::Unknown => (StatusCode::BAD_REQUEST, "unknown command").into_response(),
    }
}
