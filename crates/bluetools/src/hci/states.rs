//! LE supported states and LE feature masks
//!
//! Bit sets returned by LE Read Supported States and LE Read Local
//! Supported Features, with human-readable descriptions.

use std::fmt;

bitflags::bitflags! {
    /// States and state combinations the LE controller supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LeStates: u64 {
        const NON_CONNECTABLE_ADV = 1 << 0;
        const SCANNABLE_ADV = 1 << 1;
        const CONNECTABLE_ADV = 1 << 2;
        const DIRECTED_ADV = 1 << 3;
        const PASSIVE_SCAN = 1 << 4;
        const ACTIVE_SCAN = 1 << 5;
        const INITIATING_MASTER = 1 << 6;
        const SLAVE = 1 << 7;
        const NON_CONNECTABLE_ADV_PASSIVE_SCAN = 1 << 8;
        const SCANNABLE_ADV_PASSIVE_SCAN = 1 << 9;
        const CONNECTABLE_ADV_PASSIVE_SCAN = 1 << 10;
        const DIRECTED_ADV_PASSIVE_SCAN = 1 << 11;
        const NON_CONNECTABLE_ADV_ACTIVE_SCAN = 1 << 12;
        const SCANNABLE_ADV_ACTIVE_SCAN = 1 << 13;
        const CONNECTABLE_ADV_ACTIVE_SCAN = 1 << 14;
        const DIRECTED_ADV_ACTIVE_SCAN = 1 << 15;
        const NON_CONNECTABLE_ADV_INITIATING = 1 << 16;
        const SCANNABLE_ADV_INITIATING = 1 << 17;
        const NON_CONNECTABLE_ADV_MASTER = 1 << 18;
        const SCANNABLE_ADV_MASTER = 1 << 19;
        const NON_CONNECTABLE_ADV_SLAVE = 1 << 20;
        const SCANNABLE_ADV_SLAVE = 1 << 21;
        const PASSIVE_SCAN_INITIATING = 1 << 22;
        const ACTIVE_SCAN_INITIATING = 1 << 23;
        const PASSIVE_SCAN_MASTER = 1 << 24;
        const ACTIVE_SCAN_MASTER = 1 << 25;
        const PASSIVE_SCAN_SLAVE = 1 << 26;
        const ACTIVE_SCAN_SLAVE = 1 << 27;
        const INITIATING_MASTER_MASTER = 1 << 28;
    }
}

const STATE_DESCRIPTIONS: [(LeStates, &str); 29] = [
    (LeStates::NON_CONNECTABLE_ADV, "Non-connectable Advertising State"),
    (LeStates::SCANNABLE_ADV, "Scannable Advertising State"),
    (LeStates::CONNECTABLE_ADV, "Connectable Advertising State"),
    (LeStates::DIRECTED_ADV, "Directed Advertising State"),
    (LeStates::PASSIVE_SCAN, "Passive Scanning State"),
    (LeStates::ACTIVE_SCAN, "Active Scanning State"),
    (LeStates::INITIATING_MASTER, "Initiating State and Connection State in the Master Role"),
    (LeStates::SLAVE, "Connection State in the Slave Role"),
    (
        LeStates::NON_CONNECTABLE_ADV_PASSIVE_SCAN,
        "Non-connectable Advertising and Passive Scanning",
    ),
    (LeStates::SCANNABLE_ADV_PASSIVE_SCAN, "Scannable Advertising and Passive Scanning"),
    (LeStates::CONNECTABLE_ADV_PASSIVE_SCAN, "Connectable Advertising and Passive Scanning"),
    (LeStates::DIRECTED_ADV_PASSIVE_SCAN, "Directed Advertising and Passive Scanning"),
    (LeStates::NON_CONNECTABLE_ADV_ACTIVE_SCAN, "Non-connectable Advertising and Active Scanning"),
    (LeStates::SCANNABLE_ADV_ACTIVE_SCAN, "Scannable Advertising and Active Scanning"),
    (LeStates::CONNECTABLE_ADV_ACTIVE_SCAN, "Connectable Advertising and Active Scanning"),
    (LeStates::DIRECTED_ADV_ACTIVE_SCAN, "Directed Advertising and Active Scanning"),
    (LeStates::NON_CONNECTABLE_ADV_INITIATING, "Non-connectable Advertising and Initiating"),
    (LeStates::SCANNABLE_ADV_INITIATING, "Scannable Advertising and Initiating"),
    (LeStates::NON_CONNECTABLE_ADV_MASTER, "Non-connectable Advertising and Master Role"),
    (LeStates::SCANNABLE_ADV_MASTER, "Scannable Advertising and Master Role"),
    (LeStates::NON_CONNECTABLE_ADV_SLAVE, "Non-connectable Advertising and Slave Role"),
    (LeStates::SCANNABLE_ADV_SLAVE, "Scannable Advertising and Slave Role"),
    (LeStates::PASSIVE_SCAN_INITIATING, "Passive Scanning and Initiating"),
    (LeStates::ACTIVE_SCAN_INITIATING, "Active Scanning and Initiating"),
    (LeStates::PASSIVE_SCAN_MASTER, "Passive Scanning and Master Role"),
    (LeStates::ACTIVE_SCAN_MASTER, "Active Scanning and Master Role"),
    (LeStates::PASSIVE_SCAN_SLAVE, "Passive Scanning and Slave Role"),
    (LeStates::ACTIVE_SCAN_SLAVE, "Active Scanning and Slave Role"),
    (LeStates::INITIATING_MASTER_MASTER, "Initiating and Master Role, Master and Master Role"),
];

impl LeStates {
    /// Every known state with its description and whether it is supported
    pub fn describe(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        STATE_DESCRIPTIONS
            .iter()
            .map(move |(flag, text)| (*text, self.contains(*flag)))
    }
}

impl fmt::Display for LeStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Supported states: 0x{:016X}", self.bits())?;
        for (text, supported) in self.describe() {
            let verdict = if supported { "supported" } else { "UNsupported" };
            writeln!(f, " -> {} {}.", text, verdict)?;
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// LE link layer features (first octets of the LE feature mask)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LeFeatures: u64 {
        const ENCRYPTION = 1 << 0;
        const CONNECTION_PARAMETERS_REQUEST = 1 << 1;
        const EXTENDED_REJECT_INDICATION = 1 << 2;
        const SLAVE_INITIATED_FEATURES_EXCHANGE = 1 << 3;
        const PING = 1 << 4;
        const DATA_PACKET_LENGTH_EXTENSION = 1 << 5;
        const LL_PRIVACY = 1 << 6;
        const EXTENDED_SCANNER_FILTER_POLICIES = 1 << 7;
        const PHY_2M = 1 << 8;
        const STABLE_MODULATION_INDEX_TX = 1 << 9;
        const STABLE_MODULATION_INDEX_RX = 1 << 10;
        const PHY_CODED = 1 << 11;
        const EXTENDED_ADVERTISING = 1 << 12;
        const PERIODIC_ADVERTISING = 1 << 13;
        const CHANNEL_SELECTION_ALGORITHM_2 = 1 << 14;
        const POWER_CLASS_1 = 1 << 15;
    }
}

impl fmt::Display for LeFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.bits())?;
        for (name, _) in self.iter_names() {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}
