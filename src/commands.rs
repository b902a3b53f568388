use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Script id enum. Variant names match the script keys used under
/// `[spec.scripts]` so serde can deserialize `"status_all"` directly into
/// `Command::StatusAll`.
#[derive(Debug, Deserialize, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Login,
    Logout,
    Ping,
    Status,
    StatusAll,
    On,
    OnRanged,
    OnAll,
    Off,
    OffRanged,
    OffAll,
    Cycle,
    CycleRanged,
    CycleAll,
    Reset,
    ResetRanged,
    ResetAll,
    StatusTemp,
    StatusTempAll,
    StatusBeacon,
    StatusBeaconAll,
    BeaconOn,
    BeaconOnRanged,
    BeaconOff,
    BeaconOffRanged,
}

impl Command {
    pub const ALL: [Self; 25] = [
        Self::Login,
        Self::Logout,
        Self::Ping,
        Self::Status,
        Self::StatusAll,
        Self::On,
        Self::OnRanged,
        Self::OnAll,
        Self::Off,
        Self::OffRanged,
        Self::OffAll,
        Self::Cycle,
        Self::CycleRanged,
        Self::CycleAll,
        Self::Reset,
        Self::ResetRanged,
        Self::ResetAll,
        Self::StatusTemp,
        Self::StatusTempAll,
        Self::StatusBeacon,
        Self::StatusBeaconAll,
        Self::BeaconOn,
        Self::BeaconOnRanged,
        Self::BeaconOff,
        Self::BeaconOffRanged,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Ping => "ping",
            Self::Status => "status",
            Self::StatusAll => "status_all",
            Self::On => "on",
            Self::OnRanged => "on_ranged",
            Self::OnAll => "on_all",
            Self::Off => "off",
            Self::OffRanged => "off_ranged",
            Self::OffAll => "off_all",
            Self::Cycle => "cycle",
            Self::CycleRanged => "cycle_ranged",
            Self::CycleAll => "cycle_all",
            Self::Reset => "reset",
            Self::ResetRanged => "reset_ranged",
            Self::ResetAll => "reset_all",
            Self::StatusTemp => "status_temp",
            Self::StatusTempAll => "status_temp_all",
            Self::StatusBeacon => "status_beacon",
            Self::StatusBeaconAll => "status_beacon_all",
            Self::BeaconOn => "beacon_on",
            Self::BeaconOnRanged => "beacon_on_ranged",
            Self::BeaconOff => "beacon_off",
            Self::BeaconOffRanged => "beacon_off_ranged",
        }
    }

    /// Queries report state and never change it.
    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(
            self,
            Self::Status
                | Self::StatusAll
                | Self::StatusTemp
                | Self::StatusTempAll
                | Self::StatusBeacon
                | Self::StatusBeaconAll
        )
    }

    /// Scripts run by the device itself rather than on behalf of a client.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Login | Self::Logout | Self::Ping)
    }

    /// Script that covers every plug of a device at once.
    #[must_use]
    pub const fn all_variant(&self) -> Option<Self> {
        match self {
            Self::Status => Some(Self::StatusAll),
            Self::On => Some(Self::OnAll),
            Self::Off => Some(Self::OffAll),
            Self::Cycle => Some(Self::CycleAll),
            Self::Reset => Some(Self::ResetAll),
            Self::StatusTemp => Some(Self::StatusTempAll),
            Self::StatusBeacon => Some(Self::StatusBeaconAll),
            _ => None,
        }
    }

    /// Script that takes a ranged plug list as its `%s` argument.
    #[must_use]
    pub const fn ranged_variant(&self) -> Option<Self> {
        match self {
            Self::On => Some(Self::OnRanged),
            Self::Off => Some(Self::OffRanged),
            Self::Cycle => Some(Self::CycleRanged),
            Self::Reset => Some(Self::ResetRanged),
            Self::BeaconOn => Some(Self::BeaconOnRanged),
            Self::BeaconOff => Some(Self::BeaconOffRanged),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown script name: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for c in Command::ALL {
            assert_eq!(c.as_str().parse::<Command>(), Ok(c));
        }
        assert!("bogus".parse::<Command>().is_err());
    }

    #[test]
    fn variants() {
        assert_eq!(Command::On.all_variant(), Some(Command::OnAll));
        assert_eq!(Command::Status.ranged_variant(), None);
        assert!(Command::StatusTemp.is_query());
        assert!(!Command::Cycle.is_query());
    }
}
