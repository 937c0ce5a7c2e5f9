//! Mock WiiM / LinkPlay device
//!
//! Serves `GET /httpapi.asp?command=...` over plain HTTP, records every
//! command it receives and keeps a tiny playback model.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use wiim_control::adapters::linkplay::{DeviceEndpoint, Scheme};

/// Mock device state
#[derive(Debug, Clone)]
pub struct MockDeviceState {
    /// "play", "pause", "stop"
    pub status: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Raw `vol` field, so out-of-range values can be served
    pub vol: String,
    pub mute: bool,
    pub curpos_ms: i64,
    pub totlen_ms: i64,
    /// Serve text fields hex-encoded like real firmware
    pub hex_text: bool,
    pub art_url: String,
    pub presets: Vec<Value>,
    pub eq_list: Vec<String>,
    pub commands: Vec<String>,
    /// Answer everything with this status code
    pub fail_with: Option<u16>,
    /// Replace the getPlayerStatus body
    pub raw_status: Option<String>,
    pub delay: Duration,
}

impl Default for MockDeviceState {
    fn default() -> Self {
        Self {
            status: "stop".to_string(),
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            vol: "50".to_string(),
            mute: false,
            curpos_ms: 0,
            totlen_ms: 0,
            hex_text: true,
            art_url: String::new(),
            presets: Vec::new(),
            eq_list: vec!["Flat".to_string(), "Bass Booster".to_string()],
            commands: Vec::new(),
            fail_with: None,
            raw_status: None,
            delay: Duration::ZERO,
        }
    }
}

type SharedState = Arc<RwLock<MockDeviceState>>;

/// Mock WiiM device
pub struct MockWiimDevice {
    addr: SocketAddr,
    state: SharedState,
    handle: JoinHandle<()>,
}

impl MockWiimDevice {
    /// Start a mock device on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockDeviceState::default()));

        let app = Router::new()
            .route("/httpapi.asp", get(handle_command))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint pointing the client at this mock
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new(self.addr.ip().to_string())
            .with_port(Some(self.addr.port()))
            .with_scheme(Scheme::Http)
    }

    pub async fn set_playing(&self, title: &str, artist: &str, album: &str) {
        let mut state = self.state.write().await;
        state.status = "play".to_string();
        state.title = title.to_string();
        state.artist = artist.to_string();
        state.album = album.to_string();
    }

    pub async fn set_status(&self, status: &str) {
        self.state.write().await.status = status.to_string();
    }

    pub async fn update(&self, f: impl FnOnce(&mut MockDeviceState)) {
        f(&mut *self.state.write().await);
    }

    pub async fn add_preset(&self, number: u32, name: &str, picurl: &str) {
        self.state.write().await.presets.push(json!({
            "number": number,
            "name": name,
            "url": format!("http://stream.example/{}", number),
            "source": "Radio",
            "picurl": picurl,
        }));
    }

    pub async fn fail_with(&self, status: Option<u16>) {
        self.state.write().await.fail_with = status;
    }

    /// Commands received so far, in order
    pub async fn commands(&self) -> Vec<String> {
        self.state.read().await.commands.clone()
    }

    /// Commands other than status polls
    pub async fn control_commands(&self) -> Vec<String> {
        self.commands()
            .await
            .into_iter()
            .filter(|c| c != "getPlayerStatus" && c != "getPresetInfo" && c != "EQGetList")
            .collect()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

fn text(state: &MockDeviceState, value: &str) -> String {
    if state.hex_text {
        hex::encode_upper(value)
    } else {
        value.to_string()
    }
}

fn status_body(state: &MockDeviceState) -> String {
    json!({
        "type": "0",
        "ch": "0",
        "mode": "10",
        "loop": "4",
        "eq": "0",
        "status": state.status,
        "curpos": state.curpos_ms.to_string(),
        "offset_pts": "0",
        "totlen": state.totlen_ms.to_string(),
        "Title": text(state, &state.title),
        "Artist": text(state, &state.artist),
        "Album": text(state, &state.album),
        "albumart_uri": state.art_url,
        "alarmflag": "0",
        "plicount": "0",
        "plicurr": "0",
        "vol": state.vol,
        "mute": if state.mute { "1" } else { "0" },
    })
    .to_string()
}

async fn handle_command(
    State(state): State<SharedState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(command) = params.get("command").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing command".to_string());
    };

    let delay = state.read().await.delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut state = state.write().await;
    state.commands.push(command.clone());

    if let Some(code) = state.fail_with {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, "error".to_string());
    }

    let parts: Vec<&str> = command.splitn(3, ':').collect();
    let body = match parts.as_slice() {
        ["getPlayerStatus"] => state
            .raw_status
            .clone()
            .unwrap_or_else(|| status_body(&state)),
        ["setPlayerCmd", "pause"] => {
            state.status = "pause".to_string();
            "OK".to_string()
        }
        ["setPlayerCmd", "resume"] => {
            state.status = "play".to_string();
            "OK".to_string()
        }
        ["setPlayerCmd", "next"] | ["setPlayerCmd", "prev"] => {
            state.curpos_ms = 0;
            "OK".to_string()
        }
        ["setPlayerCmd", "vol", level] => {
            state.vol = level.to_string();
            "OK".to_string()
        }
        ["setPlayerCmd", "mute", flag] => {
            state.mute = *flag == "1";
            "OK".to_string()
        }
        ["setPlayerCmd", "seek", secs] => {
            state.curpos_ms = secs.parse::<i64>().unwrap_or(0) * 1000;
            "OK".to_string()
        }
        ["EQGetList"] => serde_json::to_string(&state.eq_list).unwrap(),
        ["EQLoad", name] => {
            if state.eq_list.iter().any(|n| n == *name) {
                "OK".to_string()
            } else {
                return (StatusCode::NOT_FOUND, "Failed".to_string());
            }
        }
        ["getPresetInfo"] => json!({
            "preset_num": state.presets.len(),
            "preset_list": state.presets,
        })
        .to_string(),
        ["MCUKeyShortClick", number] => {
            let name = state
                .presets
                .iter()
                .find(|p| p["number"].to_string() == *number)
                .and_then(|p| p["name"].as_str())
                .map(str::to_string);
            match name {
                Some(name) => {
                    state.title = name;
                    state.artist = String::new();
                    state.status = "play".to_string();
                    "OK".to_string()
                }
                None => return (StatusCode::NOT_FOUND, "Failed".to_string()),
            }
        }
        _ => "unknown command".to_string(),
    };

    (StatusCode::OK, body)
}

/// Device that accepts TCP connections and never answers
pub struct SilentDevice {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl SilentDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { addr, handle }
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new(self.addr.ip().to_string())
            .with_port(Some(self.addr.port()))
            .with_scheme(Scheme::Http)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}
