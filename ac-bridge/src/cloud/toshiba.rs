//! Toshiba Home AC Controls cloud.
//!
//! Status and energy come from the vendor's REST API by polling; commands are
//! sent as IoT Hub device-to-cloud messages over HTTPS using the SAS token the
//! REST API hands out at registration.

use super::fcu::FcuState;
use super::{CloudEvent, CloudHandle, CloudSource};
use crate::config::CloudConf;
use crate::error::{BridgeError, Channel, Result};
use crate::models::FieldMap;
use crate::store::{new_shared, Shared};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/api/Consumer/Login";
const REGISTER_PATH: &str = "/api/Consumer/RegisterMobileDevice";
const MAPPING_PATH: &str = "/api/AC/GetConsumerACMapping";
const STATE_PATH: &str = "/api/AC/GetCurrentACState";
const ENERGY_PATH: &str = "/api/AC/GetGroupACEnergyConsumption";
const IOT_HUB_API_VERSION: &str = "2020-03-13";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "IsSuccess", default)]
    is_success: bool,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "ResObj")]
    res_obj: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginResult {
    access_token: String,
    #[serde(rename = "consumerId")]
    consumer_id: String,
}

#[derive(Debug, Deserialize)]
struct Registration {
    #[serde(rename = "SasToken")]
    sas_token: String,
}

#[derive(Debug, Deserialize)]
struct AcGroup {
    #[serde(rename = "ACList", default)]
    ac_list: Vec<AcInfo>,
}

#[derive(Debug, Deserialize)]
struct AcInfo {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "DeviceUniqueId")]
    unique_id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ACStateData", default)]
    state: Option<String>,
    #[serde(rename = "FirmwareVersion", default)]
    firmware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcState {
    #[serde(rename = "ACStateData", default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcEnergy {
    #[serde(rename = "ACDeviceUniqueId")]
    unique_id: String,
    #[serde(rename = "EnergyConsumption", default)]
    consumption: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct FcuCommand<'a> {
    #[serde(rename = "sourceId")]
    source_id: &'a str,
    #[serde(rename = "messageId")]
    message_id: &'a str,
    #[serde(rename = "targetId")]
    target_id: [&'a str; 1],
    cmd: &'a str,
    payload: Value,
    #[serde(rename = "timeStamp")]
    time_stamp: &'a str,
}

#[derive(Debug, Clone)]
struct Unit {
    ac_id: String,
    unique_id: String,
    state: FcuState,
}

/// Authenticated REST session.
#[derive(Clone)]
struct Api {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl Api {
    async fn login(
        http: reqwest::Client,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<(Self, String)> {
        let base_url = base_url.trim_end_matches('/');
        let res = http
            .post(format!("{base_url}{LOGIN_PATH}"))
            .json(&json!({ "Username": username, "Password": password }))
            .send()
            .await?
            .error_for_status()?;
        let login: LoginResult = unwrap_envelope("login", res.json().await?)?;
        let api = Self { http, base_url: base_url.to_string(), token: login.access_token };
        Ok((api, login.consumer_id))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let res = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        unwrap_envelope(what, res.json().await?)
    }

    async fn post<T: DeserializeOwned>(&self, what: &str, path: &str, body: &Value) -> Result<T> {
        let res = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        unwrap_envelope(what, res.json().await?)
    }

    async fn register(&self, device_id: &str, username: &str) -> Result<String> {
        let body = json!({ "DeviceID": device_id, "DeviceType": "1", "Username": username });
        let reg: Registration = self.post("registration", REGISTER_PATH, &body).await?;
        Ok(reg.sas_token)
    }

    async fn units(&self, consumer_id: &str) -> Result<Vec<AcInfo>> {
        let groups: Vec<AcGroup> =
            self.get("discovery", MAPPING_PATH, &[("consumerId", consumer_id)]).await?;
        Ok(groups.into_iter().flat_map(|g| g.ac_list).collect())
    }

    async fn state(&self, ac_id: &str) -> Result<Option<String>> {
        let state: AcState = self.get("state", STATE_PATH, &[("ACId", ac_id)]).await?;
        Ok(state.state)
    }

    /// Energy used this year so far, in Wh, per unit.
    async fn energy(
        &self,
        unique_ids: &[String],
        now: OffsetDateTime,
    ) -> Result<HashMap<String, f64>> {
        let body = json!({
            "ACDeviceUniqueIdList": unique_ids,
            "FromUtcTime": now.year().to_string(),
            "Timezone": "UTC",
            "ToUtcTime": (now.year() + 1).to_string(),
        });
        let rows: Vec<AcEnergy> = self.post("energy", ENERGY_PATH, &body).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.unique_id, row.consumption.iter().filter_map(energy_wh).sum()))
            .collect())
    }
}

fn unwrap_envelope<T>(what: &str, envelope: Envelope<T>) -> Result<T> {
    match envelope {
        Envelope { is_success: true, res_obj: Some(obj), .. } => Ok(obj),
        Envelope { message, .. } => Err(BridgeError::Protocol(format!(
            "{what} rejected: {}",
            message.unwrap_or_else(|| "no result".into())
        ))),
    }
}

fn energy_wh(entry: &Value) -> Option<f64> {
    match entry.get("Energy")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// IoT Hub host from a SAS token's `sr=` resource URI.
fn hub_host(sas_token: &str) -> Result<String> {
    let resource = sas_token
        .trim_start_matches("SharedAccessSignature")
        .trim()
        .split('&')
        .find_map(|part| part.strip_prefix("sr="))
        .ok_or_else(|| BridgeError::Protocol("SAS token has no resource URI".into()))?;
    let decoded = urlencoding::decode(resource)
        .map_err(|e| BridgeError::Protocol(format!("SAS resource URI: {e}")))?;
    match decoded.split('/').next() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(BridgeError::Protocol(format!("SAS resource URI has no host: {decoded}"))),
    }
}

fn decode_state(name: &str, hex: &str) -> Result<FcuState> {
    FcuState::decode(hex).map_err(|e| BridgeError::Protocol(format!("[{name}] {e}")))
}

fn published_fields(name: &str, state: &FcuState) -> Result<FieldMap> {
    state.to_fields().map_err(|e| BridgeError::Protocol(format!("[{name}] {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct EnergyReading {
    wh: f64,
    at: OffsetDateTime,
}

/// Average power since the previous reading. The first reading, and any reading
/// where the counter went backwards, only sets the baseline.
fn power_since(previous: Option<EnergyReading>, current: EnergyReading) -> Option<f64> {
    let previous = previous?;
    let seconds = (current.at - previous.at).as_seconds_f64();
    if current.wh < previous.wh || seconds <= 0.0 {
        return None;
    }
    Some((current.wh - previous.wh) * 3600.0 / seconds)
}

/// Cloud channel after a successful login.
pub struct ToshibaCloud {
    http: reqwest::Client,
    sas_token: String,
    hub_host: String,
    source_id: String,
    units: Shared<HashMap<String, Unit>>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

pub struct ToshibaEvents {
    rx: mpsc::Receiver<Result<CloudEvent>>,
}

/// Logs in, registers this client if no SAS token is configured, discovers the
/// units and starts polling them.
pub async fn connect(
    cfg: &CloudConf,
    username: &str,
    password: &str,
) -> Result<(ToshibaCloud, ToshibaEvents)> {
    let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
    let (api, consumer_id) = Api::login(http.clone(), &cfg.base_url, username, password).await?;
    info!("Logged in to {} as {}", cfg.base_url, username);

    let source_id = format!("{}_{}", username, cfg.device_id);
    let sas_token = match &cfg.sas_token {
        Some(token) => token.clone(),
        None => api.register(&source_id, username).await?,
    };
    let hub_host = hub_host(&sas_token)?;
    debug!("IoT hub: {}", hub_host);

    let mut units = HashMap::new();
    let mut initial = Vec::new();
    for ac in api.units(&consumer_id).await? {
        info!(
            "[{}] found unit {} (firmware {})",
            ac.name,
            ac.unique_id,
            ac.firmware_version.as_deref().unwrap_or("?")
        );
        let mut state = FcuState::default();
        if let Some(hex) = ac.state.as_deref().filter(|s| !s.is_empty()) {
            state = decode_state(&ac.name, hex)?;
            let fields = published_fields(&ac.name, &state)?;
            initial.push(CloudEvent::Status { device_id: ac.name.clone(), fields });
        }
        if units.contains_key(&ac.name) {
            warn!("[{}] duplicate unit name, keeping the last one", ac.name);
        }
        units.insert(ac.name, Unit { ac_id: ac.id, unique_id: ac.unique_id, state });
    }

    let units = new_shared(units);
    let (tx, rx) = mpsc::channel(64);
    let poller = Poller {
        api,
        units: units.clone(),
        tx,
        state_every: Duration::from_secs(cfg.state_poll_secs.max(1)),
        energy_every: Duration::from_secs(cfg.energy_poll_secs.max(1)),
        baselines: HashMap::new(),
    };
    let handle = tokio::spawn(poller.run(initial));

    let cloud = ToshibaCloud {
        http,
        sas_token,
        hub_host,
        source_id,
        units,
        poller: parking_lot::Mutex::new(Some(handle)),
    };
    Ok((cloud, ToshibaEvents { rx }))
}

struct Poller {
    api: Api,
    units: Shared<HashMap<String, Unit>>,
    tx: mpsc::Sender<Result<CloudEvent>>,
    state_every: Duration,
    energy_every: Duration,
    baselines: HashMap<String, EnergyReading>,
}

impl Poller {
    async fn run(mut self, initial: Vec<CloudEvent>) {
        let tx = self.tx.clone();
        if let Err(e) = self.poll(initial).await {
            let _ = tx.send(Err(e)).await;
        }
    }

    /// Returns `Ok` only once the receiving side is gone.
    async fn poll(&mut self, initial: Vec<CloudEvent>) -> Result<()> {
        if !self.emit(CloudEvent::Connected).await {
            return Ok(());
        }
        for event in initial {
            if !self.emit(event).await {
                return Ok(());
            }
        }

        let mut state_tick = tokio::time::interval(self.state_every);
        let mut energy_tick = tokio::time::interval(self.energy_every);
        state_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        energy_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Discovery already delivered the current state.
        state_tick.tick().await;

        loop {
            let open = tokio::select! {
                _ = state_tick.tick() => self.poll_states().await?,
                _ = energy_tick.tick() => self.poll_energy().await?,
            };
            if !open {
                return Ok(());
            }
        }
    }

    async fn emit(&self, event: CloudEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    async fn poll_states(&self) -> Result<bool> {
        let targets: Vec<(String, String)> = self
            .units
            .lock()
            .iter()
            .map(|(name, unit)| (name.clone(), unit.ac_id.clone()))
            .collect();

        for (name, ac_id) in targets {
            let Some(hex) = self.api.state(&ac_id).await? else {
                debug!("[{}] no state reported", name);
                continue;
            };
            let update = decode_state(&name, &hex)?;
            let merged = {
                let mut units = self.units.lock();
                let Some(unit) = units.get_mut(&name) else { continue };
                unit.state = unit.state.merged(&update);
                unit.state
            };
            debug!("[{}] state {}", name, hex);
            let fields = published_fields(&name, &merged)?;
            if !self.emit(CloudEvent::Status { device_id: name.clone(), fields }).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn poll_energy(&mut self) -> Result<bool> {
        let names: HashMap<String, String> = self
            .units
            .lock()
            .iter()
            .map(|(name, unit)| (unit.unique_id.clone(), name.clone()))
            .collect();
        if names.is_empty() {
            return Ok(true);
        }
        let ids: Vec<String> = names.keys().cloned().collect();
        let now = OffsetDateTime::now_utc();

        for (unique_id, wh) in self.api.energy(&ids, now).await? {
            let Some(name) = names.get(&unique_id) else {
                debug!("energy for unknown unit {}", unique_id);
                continue;
            };
            let reading = EnergyReading { wh, at: now };
            let previous = self.baselines.insert(unique_id, reading);
            match power_since(previous, reading) {
                Some(watts) => {
                    debug!("[{}] power {:.1} W", name, watts);
                    let sample = CloudEvent::Power { device_id: name.clone(), watts, at: now };
                    if !self.emit(sample).await {
                        return Ok(false);
                    }
                }
                None => debug!("[{}] energy baseline {} Wh", name, wh),
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl CloudHandle for ToshibaCloud {
    fn command_fields(&self) -> BTreeSet<String> {
        super::fcu::command_fields().map(str::to_string).collect()
    }

    async fn send_command(&self, device_id: &str, fields: FieldMap) -> Result<()> {
        let requested = FcuState::from_fields(&fields)
            .map_err(|e| BridgeError::InvalidCommand(e.to_string()))?;
        let (unique_id, current) = {
            let units = self.units.lock();
            let unit = units
                .get(device_id)
                .ok_or_else(|| BridgeError::InvalidCommand(format!("unknown unit {device_id}")))?;
            (unit.unique_id.clone(), unit.state)
        };

        let hex = FcuState::prepare_command(&current, requested).encode();
        let body = FcuCommand {
            source_id: &self.source_id,
            message_id: "0000000",
            target_id: [unique_id.as_str()],
            cmd: "CMD_FCU_TO_AC",
            payload: json!({ "data": hex }),
            time_stamp: "0000000",
        };
        debug!("[{}] sending {}", device_id, hex);

        let url = format!(
            "https://{}/devices/{}/messages/events?api-version={}",
            self.hub_host,
            urlencoding::encode(&self.source_id),
            IOT_HUB_API_VERSION
        );
        self.http
            .post(url)
            .header("Authorization", &self.sas_token)
            .header("iothub-app-type", "mob")
            .header("iothub-contenttype", "application/json")
            .header("iothub-contentencoding", "utf-8")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        debug!("Cloud session closed");
        Ok(())
    }
}

#[async_trait]
impl CloudSource for ToshibaEvents {
    async fn next_event(&mut self) -> Result<CloudEvent> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(BridgeError::connection_lost(Channel::Cloud, "poller stopped")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_host_from_sas_token() {
        let token = concat!(
            "SharedAccessSignature sr=prodhub.azure-devices.net%2Fdevices%2Fme_3e6e",
            "&sig=abc%3D&se=1700000000",
        );
        assert_eq!(hub_host(token).unwrap(), "prodhub.azure-devices.net");
        assert!(matches!(hub_host("SharedAccessSignature sig=abc"), Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_envelope_rejection_is_protocol_error() {
        let ok: Envelope<Registration> =
            serde_json::from_str(r#"{"IsSuccess": true, "ResObj": {"SasToken": "t"}}"#).unwrap();
        assert_eq!(unwrap_envelope("registration", ok).unwrap().sas_token, "t");

        let denied: Envelope<Registration> = serde_json::from_str(
            r#"{"IsSuccess": false, "Message": "Invalid credentials", "ResObj": null}"#,
        )
        .unwrap();
        let err = unwrap_envelope("login", denied).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cloud protocol violation: login rejected: Invalid credentials"
        );
    }

    #[test]
    fn test_discovery_payload() {
        let groups: Envelope<Vec<AcGroup>> = serde_json::from_str(
            r#"{"IsSuccess": true, "ResObj": [{"GroupName": "Home", "ACList": [
                {"Id": "a1", "DeviceUniqueId": "u1", "Name": "living-room",
                 "ACStateData": "30421641316400101f18000100001001020a1e", "FirmwareVersion": "3.2"}
            ]}]}"#,
        )
        .unwrap();
        let units: Vec<AcInfo> = unwrap_envelope("discovery", groups)
            .unwrap()
            .into_iter()
            .flat_map(|g| g.ac_list)
            .collect();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "living-room");

        let state = decode_state("living-room", units[0].state.as_deref().unwrap()).unwrap();
        let fields = published_fields("living-room", &state).unwrap();
        assert_eq!(fields["ac_mode"], 0x42.into());
    }

    #[test]
    fn test_energy_values_may_be_text() {
        assert_eq!(energy_wh(&json!({"Energy": "12.5"})), Some(12.5));
        assert_eq!(energy_wh(&json!({"Energy": 3})), Some(3.0));
        assert_eq!(energy_wh(&json!({"Hour": 3})), None);
    }

    #[test]
    fn test_power_from_energy_deltas() {
        let t0 = OffsetDateTime::now_utc();
        let first = EnergyReading { wh: 1000.0, at: t0 };
        assert_eq!(power_since(None, first), None);

        let second = EnergyReading { wh: 1050.0, at: t0 + time::Duration::minutes(6) };
        assert_eq!(power_since(Some(first), second), Some(500.0));

        let rollover = EnergyReading { wh: 2.0, at: t0 + time::Duration::minutes(12) };
        assert_eq!(power_since(Some(second), rollover), None);
    }

    #[test]
    fn test_command_body_shape() {
        let body = FcuCommand {
            source_id: "me_3e6e",
            message_id: "0000000",
            target_id: ["u1"],
            cmd: "CMD_FCU_TO_AC",
            payload: json!({"data": "30ffffffffffffffffffffffffffffffffffff"}),
            time_stamp: "0000000",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["targetId"], json!(["u1"]));
        assert_eq!(value["cmd"], "CMD_FCU_TO_AC");
        assert_eq!(value["sourceId"], "me_3e6e");
    }
}
