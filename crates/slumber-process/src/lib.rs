use std::fmt;

/// Identifies one awake period, i.e. one spawned game server process.
///
/// Events produced by the server waiter and the idle monitor carry the run they
/// belong to so the controller can drop anything left over from a previous run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Sleeping,
    Starting,
    Awake,
    Stopping,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sleeping => "SLEEPING",
            Mode::Starting => "STARTING",
            Mode::Awake => "AWAKE",
            Mode::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a game server process ended. Diagnostic only; every exit is handled the same way.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub runtime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_error: Option<String>,
}

impl ServerExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.wait_error.is_none()
    }
}

pub const SLEEPING_PLAYER_COUNT: &str = "SLEEPING";

/// Body served by the stand-in status endpoint while the real server is stopped.
///
/// Mirrors the shape of TShock's `/v2/server/status` closely enough for dashboards.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SleepingStatus {
    pub port: u16,
    pub playercount: String,
    pub maxplayers: u32,
    pub status: u16,
    pub players: Vec<serde_json::Value>,
}

impl SleepingStatus {
    pub fn new(port: u16, maxplayers: u32) -> Self {
        Self {
            port,
            playercount: SLEEPING_PLAYER_COUNT.to_string(),
            maxplayers,
            status: 200,
            players: Vec::new(),
        }
    }
}

/// Extracts the connected client count from a status response.
///
/// A numeric `playercount` wins; when it is missing or null the length of `players`
/// is used. Anything else (e.g. `"playercount": "SLEEPING"`) yields `None`.
pub fn client_count(body: &serde_json::Value) -> Option<u64> {
    match body.get("playercount") {
        None | Some(serde_json::Value::Null) => body
            .get("players")?
            .as_array()
            .map(|players| players.len() as u64),
        Some(v) => v.as_u64(),
    }
}
