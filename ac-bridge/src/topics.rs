use serde::{Deserialize, Serialize};

/// Topic layout of the bridge: `<root>/status`, `<root>/cmd`,
/// `<root>/<device>/status`, `<root>/<device>/power`, `<root>/<device>/cmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub root: String,
    pub status: String,
    pub cmd: String,
    pub power: String,
    pub online: String,
    pub offline: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            root: "ac".into(),
            status: "status".into(),
            cmd: "cmd".into(),
            power: "power".into(),
            online: "online".into(),
            offline: "offline".into(),
        }
    }
}

impl Topics {
    /// Retained online/offline heartbeat of the whole bridge.
    pub fn bridge_status(&self) -> String {
        format!("{}/{}", self.root, self.status)
    }

    /// Bridge-wide commands (`status` = resend every snapshot).
    pub fn general_command(&self) -> String {
        format!("{}/{}", self.root, self.cmd)
    }

    pub fn device_status(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.root, device_id, self.status)
    }

    pub fn device_power(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.root, device_id, self.power)
    }

    pub fn device_command(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.root, device_id, self.cmd)
    }

    pub fn command_wildcard(&self) -> String {
        format!("{}/+/{}", self.root, self.cmd)
    }

    /// Extracts the device id from a device command topic.
    /// Ex: "ac/living-room/cmd" -> Some("living-room")
    pub fn command_device<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let device = rest.strip_suffix(self.cmd.as_str())?.strip_suffix('/')?;
        if device.is_empty() || device.contains('/') {
            return None;
        }
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topic_names() {
        let topics = Topics::default();
        assert_eq!(topics.bridge_status(), "ac/status");
        assert_eq!(topics.general_command(), "ac/cmd");
        assert_eq!(topics.device_status("living-room"), "ac/living-room/status");
        assert_eq!(topics.device_power("living-room"), "ac/living-room/power");
        assert_eq!(topics.command_wildcard(), "ac/+/cmd");
    }

    #[test]
    fn test_command_device_extraction() {
        let topics = Topics::default();
        assert_eq!(topics.command_device("ac/living-room/cmd"), Some("living-room"));
        assert_eq!(topics.command_device("ac/cmd"), None);
        assert_eq!(topics.command_device("ac//cmd"), None);
        assert_eq!(topics.command_device("ac/a/b/cmd"), None);
        assert_eq!(topics.command_device("ac/living-room/status"), None);
        assert_eq!(topics.command_device("other/living-room/cmd"), None);
    }

    #[test]
    fn test_custom_root() {
        let topics = Topics { root: "home/hvac".into(), ..Topics::default() };
        assert_eq!(topics.command_device("home/hvac/den/cmd"), Some("den"));
        assert_eq!(topics.device_command("den"), "home/hvac/den/cmd");
    }
}
