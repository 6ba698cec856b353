//! JSON request surface over the memory access layer.
//!
//! Requests are single JSON objects:
//!
//! ```text
//! {"command":"read","params":{"address":536870912,"size":4}}
//! {"command":"write","params":{"address":536870912,"value":230.5,"size":4}}
//! ```
//!
//! Without an attached master the bridge answers reads with random values
//! inside the parameter's declared range and acknowledges writes, so a UI can
//! be developed without hardware.

use crate::master::XcpMaster;
use crate::memory::ParameterValue;
use crate::registry::{ParameterRegistry, ValueKind};
use crate::transport::Transport;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

pub const ERR_INVALID_JSON: &str = "Invalid JSON";
pub const ERR_MISSING_READ_FIELDS: &str = "Missing address or size";
pub const ERR_MISSING_WRITE_FIELDS: &str = "Missing address, value or size";
pub const ERR_UNKNOWN_COMMAND: &str = "Unknown command";
pub const ERR_INVALID_SIZE: &str = "Invalid size";

/// Receives bridge notifications. Called from client tasks; keep it quick.
pub trait BridgeObserver: Send + Sync {
    /// Latest value of every parameter read so far
    fn on_value_update(&self, values: &BTreeMap<String, f64>);

    /// Whether at least one client is connected
    fn on_connection_change(&self, connected: bool);
}

#[derive(Debug, Default, Deserialize)]
struct ReadParams {
    address: Option<u32>,
    size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WriteParams {
    address: Option<u32>,
    value: Option<Number>,
    size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeResponse {
    Read {
        command: &'static str,
        address: u32,
        value: Value,
        ts: f64,
    },
    Write {
        command: &'static str,
        address: u32,
        success: bool,
        ts: f64,
    },
    Error {
        error: String,
    },
}

impl BridgeResponse {
    pub fn error(message: impl Into<String>) -> Self {
        BridgeResponse::Error { error: message.into() }
    }

    fn read(address: u32, value: Value) -> Self {
        BridgeResponse::Read {
            command: "read",
            address,
            value,
            ts: timestamp(),
        }
    }

    fn write(address: u32, success: bool) -> Self {
        BridgeResponse::Write {
            command: "write",
            address,
            success,
            ts: timestamp(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub struct Bridge<T: Transport> {
    master: Option<Arc<XcpMaster<T>>>,
    registry: Arc<ParameterRegistry>,
    rng: Mutex<StdRng>,
    current_values: Mutex<BTreeMap<String, f64>>,
    observers: RwLock<Vec<Arc<dyn BridgeObserver>>>,
}

impl<T: Transport> Bridge<T> {
    /// Bridge over `master`, or in simulation when `master` is `None`
    pub fn new(master: Option<Arc<XcpMaster<T>>>, registry: Arc<ParameterRegistry>) -> Self {
        Self {
            master,
            registry,
            rng: Mutex::new(StdRng::from_entropy()),
            current_values: Mutex::new(BTreeMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Fix the simulation RNG seed for reproducible values
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.master.is_none()
    }

    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    pub fn register_observer(&self, observer: Arc<dyn BridgeObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub fn current_values(&self) -> BTreeMap<String, f64> {
        self.current_values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// Handle one raw request message
    pub async fn handle_message(&self, message: &str) -> BridgeResponse {
        let request: Value = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejected bridge request");
                return BridgeResponse::error(ERR_INVALID_JSON);
            }
        };
        let params = request
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        match request.get("command").and_then(Value::as_str) {
            Some("read") => match serde_json::from_value::<ReadParams>(params) {
                Ok(ReadParams {
                    address: Some(address),
                    size: Some(size),
                }) => self.read(address, size).await,
                Ok(_) => BridgeResponse::error(ERR_MISSING_READ_FIELDS),
                Err(e) => BridgeResponse::error(format!("Invalid params: {}", e)),
            },
            Some("write") => match serde_json::from_value::<WriteParams>(params) {
                Ok(WriteParams {
                    address: Some(address),
                    value: Some(value),
                    size: Some(size),
                }) => self.write(address, &value, size).await,
                Ok(_) => BridgeResponse::error(ERR_MISSING_WRITE_FIELDS),
                Err(e) => BridgeResponse::error(format!("Invalid params: {}", e)),
            },
            _ => BridgeResponse::error(ERR_UNKNOWN_COMMAND),
        }
    }

    /// Read a parameter and publish it to observers on success
    pub async fn read(&self, address: u32, size: usize) -> BridgeResponse {
        if !matches!(size, 1 | 2 | 4) {
            return BridgeResponse::error(ERR_INVALID_SIZE);
        }

        let (value, numeric) = match &self.master {
            None => self.simulate_read(address),
            Some(master) => match master.read_parameter(address, size).await {
                Ok(value) => (value.to_json(), value.as_f64()),
                Err(e) => {
                    warn!(address = format_args!("0x{:08X}", address), error = %e, "Bridge read failed");
                    return BridgeResponse::error(e.to_string());
                }
            },
        };

        if let Some(numeric) = numeric {
            self.publish(address, numeric);
        }
        BridgeResponse::read(address, value)
    }

    /// Write a parameter; simulated writes always succeed
    pub async fn write(&self, address: u32, value: &Number, size: usize) -> BridgeResponse {
        if !matches!(size, 1 | 2 | 4) {
            return BridgeResponse::error(ERR_INVALID_SIZE);
        }
        let Some(master) = &self.master else {
            return BridgeResponse::write(address, true);
        };
        let Some(value) = ParameterValue::from_json(value) else {
            return BridgeResponse::write(address, false);
        };

        let success = match master.write_parameter(address, &value, size).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = format_args!("0x{:08X}", address), error = %e, "Bridge write failed");
                false
            }
        };
        BridgeResponse::write(address, success)
    }

    /// Random value within the catalogued range; 0 for unknown addresses
    fn simulate_read(&self, address: u32) -> (Value, Option<f64>) {
        let Some(param) = self.registry.lookup_by_address(address) else {
            return (Value::from(0), Some(0.0));
        };
        let Ok(mut rng) = self.rng.lock() else {
            return (Value::from(0), Some(0.0));
        };

        match param.kind {
            ValueKind::Float => {
                let raw: f64 = rng.gen_range(param.min..=param.max);
                let value = ((raw * 1000.0).round() / 1000.0).clamp(param.min, param.max);
                let json = Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null);
                (json, Some(value))
            }
            ValueKind::Uint => {
                let lo = param.min.max(0.0).ceil() as i64;
                let hi = (param.max.floor() as i64).max(lo);
                let value = rng.gen_range(lo..=hi);
                (Value::from(value), Some(value as f64))
            }
        }
    }

    fn publish(&self, address: u32, value: f64) {
        let Some(param) = self.registry.lookup_by_address(address) else {
            return;
        };
        let snapshot = match self.current_values.lock() {
            Ok(mut values) => {
                values.insert(param.name.clone(), value);
                values.clone()
            }
            Err(_) => return,
        };
        for observer in self.observers() {
            observer.on_value_update(&snapshot);
        }
    }

    pub fn notify_connection_change(&self, connected: bool) {
        for observer in self.observers() {
            observer.on_connection_change(connected);
        }
    }

    fn observers(&self) -> Vec<Arc<dyn BridgeObserver>> {
        self.observers
            .read()
            .map(|observers| observers.clone())
            .unwrap_or_default()
    }
}
