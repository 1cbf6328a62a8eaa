//! Local network interface discovery
//!
//! Finds the IPv4 addresses other devices on the LAN can use to reach this
//! host. Enumeration is best effort: [`list_addresses`] and
//! [`primary_address`] treat any OS error as "no addresses".

#[cfg(any(windows, test))]
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};

const WIRELESS_TOKENS: [&str; 2] = ["wi-fi", "wireless"];

/// A usable IPv4 address and the interface that carries it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub name: String,
    pub address: Ipv4Addr,
}

/// One address entry as reported by the operating system, before filtering
#[derive(Debug, Clone)]
pub struct InterfaceRecord {
    pub name: String,
    pub description: Option<String>,
    pub is_up: bool,
    pub is_loopback: bool,
    pub address: IpAddr,
}

impl InterfaceRecord {
    fn usable_ipv4(&self) -> Option<Ipv4Addr> {
        if !self.is_up || self.is_loopback {
            return None;
        }
        match self.address {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_link_local() => Some(ip),
            _ => None,
        }
    }

    fn is_wireless(&self) -> bool {
        let name = self.name.to_lowercase();
        let description = self
            .description
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();

        WIRELESS_TOKENS
            .iter()
            .any(|token| name.contains(token) || description.contains(token))
            || (cfg!(target_os = "linux") && name.starts_with("wl"))
    }
}

/// All up, non-loopback, non-link-local IPv4 addresses, in OS order
pub fn list_addresses() -> Vec<InterfaceAddress> {
    match enumerate() {
        Ok(records) => qualifying(&records),
        Err(e) => {
            warn!("Could not enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// The address to advertise: a Wi-Fi interface if there is one, otherwise
/// the first qualifying interface. `None` when nothing qualifies.
pub fn primary_address() -> Option<Ipv4Addr> {
    match enumerate() {
        Ok(records) => select_primary(&records),
        Err(e) => {
            warn!("Could not enumerate network interfaces: {}", e);
            None
        }
    }
}

/// Apply the address filters to raw interface records
pub fn qualifying(records: &[InterfaceRecord]) -> Vec<InterfaceAddress> {
    records
        .iter()
        .filter_map(|record| {
            record.usable_ipv4().map(|address| InterfaceAddress {
                name: record.name.clone(),
                address,
            })
        })
        .collect()
}

/// Pick the preferred address from raw interface records
pub fn select_primary(records: &[InterfaceRecord]) -> Option<Ipv4Addr> {
    let wireless = records
        .iter()
        .filter(|record| record.is_wireless())
        .find_map(InterfaceRecord::usable_ipv4);

    wireless.or_else(|| records.iter().find_map(InterfaceRecord::usable_ipv4))
}

/// Read every address-bearing interface entry from the OS
#[cfg(unix)]
pub fn enumerate() -> io::Result<Vec<InterfaceRecord>> {
    use nix::net::if_::InterfaceFlags;

    let mut records = Vec::new();
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let Some(ipv4) = ifaddr
            .address
            .as_ref()
            .and_then(|address| address.as_sockaddr_in())
            .map(|sin| Ipv4Addr::from(sin.ip()))
        else {
            continue;
        };

        let flags = ifaddr.flags;
        records.push(InterfaceRecord {
            description: interface_description(&ifaddr.interface_name),
            name: ifaddr.interface_name,
            is_up: flags.contains(InterfaceFlags::IFF_UP)
                && flags.contains(InterfaceFlags::IFF_RUNNING),
            is_loopback: flags.contains(InterfaceFlags::IFF_LOOPBACK),
            address: IpAddr::V4(ipv4),
        });
    }

    debug!("Found {} IPv4 interface entries", records.len());
    Ok(records)
}

/// Read every address-bearing interface entry from the OS
///
/// `if-addrs` reports neither the operational state nor the adapter
/// description, so both come from `netsh`. Adapters it does not list are
/// taken as up with no description.
#[cfg(windows)]
pub fn enumerate() -> io::Result<Vec<InterfaceRecord>> {
    let states = netsh_output(&["interface", "show", "interface"])
        .map(|output| parse_interface_states(&output))
        .unwrap_or_default();
    let descriptions = netsh_output(&["wlan", "show", "interfaces"])
        .map(|output| parse_wlan_descriptions(&output))
        .unwrap_or_default();

    let records: Vec<InterfaceRecord> = if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| InterfaceRecord {
            is_loopback: iface.is_loopback(),
            address: iface.ip(),
            description: descriptions.get(&iface.name).cloned(),
            is_up: states.get(&iface.name).copied().unwrap_or(true),
            name: iface.name,
        })
        .collect();

    debug!("Found {} interface entries", records.len());
    Ok(records)
}

#[cfg(windows)]
fn netsh_output(args: &[&str]) -> Option<String> {
    match std::process::Command::new("netsh").args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!("netsh {} exited with {}", args.join(" "), output.status);
            None
        }
        Err(e) => {
            debug!("Could not run netsh {}: {}", args.join(" "), e);
            None
        }
    }
}

/// Connected state per adapter from `netsh interface show interface`.
///
/// The name column starts where the last header column starts; the state is
/// the second column. Rows with a state other than Connected or Disconnected
/// are left out.
#[cfg(any(windows, test))]
fn parse_interface_states(output: &str) -> HashMap<String, bool> {
    let mut states = HashMap::new();
    let mut name_column = None;
    let mut in_table = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.trim_start().starts_with("---") {
            in_table = true;
            continue;
        }
        if !in_table {
            name_column = line.rfind("Interface Name");
            continue;
        }

        let connected = match line.split_whitespace().nth(1) {
            Some(state) if state.eq_ignore_ascii_case("connected") => true,
            Some(state) if state.eq_ignore_ascii_case("disconnected") => false,
            _ => continue,
        };
        let name = name_column
            .and_then(|column| line.get(column..))
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|| line.split_whitespace().skip(3).collect::<Vec<_>>().join(" "));
        if !name.is_empty() {
            states.insert(name, connected);
        }
    }
    states
}

/// Adapter descriptions from `netsh wlan show interfaces`
#[cfg(any(windows, test))]
fn parse_wlan_descriptions(output: &str) -> HashMap<String, String> {
    let mut descriptions = HashMap::new();
    let mut current = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Name" => current = Some(value.trim().to_string()),
            "Description" => {
                if let Some(name) = current.take() {
                    descriptions.insert(name, value.trim().to_string());
                }
            }
            _ => {}
        }
    }
    descriptions
}

#[cfg(not(any(unix, windows)))]
pub fn enumerate() -> io::Result<Vec<InterfaceRecord>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration is not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn interface_description(name: &str) -> Option<String> {
    let wireless = std::path::Path::new("/sys/class/net")
        .join(name)
        .join("wireless");
    wireless.exists().then(|| "Wireless LAN adapter".to_string())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn interface_description(_name: &str) -> Option<String> {
    None
}
