//! Settings are runtime-manageable dynamic configurations stored in the
//! backend and hot-swapped into the running process.

use std::borrow::Cow;
use std::time::Duration;

use int_enum::IntEnum;
use serde::{Deserialize, Serialize};

use drawbridge_domain::{GatewayError, GatewayResult};

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntEnum, Deserialize, Serialize, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Setting {
    /// How often to rotate proxy server certificates
    ServerCertRotationRate = 0,
    /// Lock watcher staleness bound in strict mode
    LockStaleThreshold = 1,
    /// Grace period for terminating lock-covered sessions after staleness
    LockStaleGracePeriod = 2,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub server_cert_rotation_rate: Duration,
    pub lock_stale_threshold: Duration,
    pub lock_stale_grace_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_cert_rotation_rate: Duration::from_secs(60 * 60 * 24),
            lock_stale_threshold: Duration::from_secs(5 * 60),
            lock_stale_grace_period: Duration::from_secs(60),
        }
    }
}

impl Settings {
    pub fn try_set(&mut self, setting: Setting, value: Cow<str>) -> GatewayResult<()> {
        let parsed = humantime::parse_duration(&value)
            .map_err(|err| GatewayError::BadParameter(format!("setting {setting:?}: {err}")))?;

        match setting {
            Setting::ServerCertRotationRate => self.server_cert_rotation_rate = parsed,
            Setting::LockStaleThreshold => self.lock_stale_threshold = parsed,
            Setting::LockStaleGracePeriod => self.lock_stale_grace_period = parsed,
        }

        Ok(())
    }
}
