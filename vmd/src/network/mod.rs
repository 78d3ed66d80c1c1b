use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::configuration::NetworkSettings;
use crate::db::vms::Vm;
use crate::errors::{Error, Result};

/// A host tap device, MAC address, and guest IPv4 address assigned to one
/// running VM. Released back to the pool on `stop`.
#[derive(Debug, Clone)]
pub struct NetworkTriple {
    pub tap_device: String,
    pub mac_address: String,
    pub ip_address: String,
}

struct State {
    allocated_ips: HashSet<Ipv4Addr>,
    next_tap_index: u32,
}

/// Allocates tap devices, MACs, and IPs out of a single configured /24,
/// serialized by its own mutex independent of the per-VM lifecycle locks.
pub struct NetworkAllocator {
    bridge_name: String,
    network: Ipv4Addr,
    prefix_len: u8,
    host_ip: Ipv4Addr,
    tap_prefix: String,
    state: Mutex<State>,
}

impl NetworkAllocator {
    pub fn new(settings: &NetworkSettings) -> Result<Self> {
        let (network, prefix_len) = parse_cidr(&settings.subnet)?;
        let host_ip = Ipv4Addr::from_str(&settings.host_ip)
            .map_err(|e| Error::HostOp(format!("invalid host_ip: {e}")))?;

        Ok(Self {
            bridge_name: settings.bridge_name.clone(),
            network,
            prefix_len,
            host_ip,
            tap_prefix: settings.tap_prefix.clone(),
            state: Mutex::new(State {
                allocated_ips: HashSet::new(),
                next_tap_index: 0,
            }),
        })
    }

    /// Rebuilds in-memory allocation state from VMs the database still
    /// reports as `running`. Called once at startup.
    pub async fn reclaim_from(&self, running: &[Vm]) {
        let mut state = self.state.lock().await;
        let mut max_index = 0u32;
        for vm in running {
            if let Some(ip) = vm.ip_address.as_deref().and_then(|s| Ipv4Addr::from_str(s).ok()) {
                state.allocated_ips.insert(ip);
            }
            if let Some(tap) = vm.tap_device.as_deref() {
                if let Some(index) = tap.strip_prefix(&self.tap_prefix).and_then(|s| s.parse::<u32>().ok()) {
                    max_index = max_index.max(index + 1);
                }
            }
        }
        state.next_tap_index = state.next_tap_index.max(max_index);
    }

    pub async fn allocate(&self) -> Result<NetworkTriple> {
        let (ip, tap_index) = {
            let mut state = self.state.lock().await;
            let ip = self
                .lowest_free_ip(&state.allocated_ips)
                .ok_or_else(|| Error::Exhausted("no free ip address in subnet".into()))?;
            state.allocated_ips.insert(ip);
            let tap_index = state.next_tap_index;
            state.next_tap_index += 1;
            (ip, tap_index)
        };

        let tap_device = format!("{}{}", self.tap_prefix, tap_index);
        let mac_address = mac_from_ip(ip);

        if let Err(e) = self.create_tap_device(&tap_device).await {
            let mut state = self.state.lock().await;
            state.allocated_ips.remove(&ip);
            return Err(e);
        }

        Ok(NetworkTriple {
            tap_device,
            mac_address,
            ip_address: ip.to_string(),
        })
    }

    pub async fn release(&self, triple: &NetworkTriple) {
        if let Err(e) = self.delete_tap_device(&triple.tap_device).await {
            tracing::warn!(tap = %triple.tap_device, error = %e, "failed to delete tap device during release");
        }
        if let Ok(ip) = Ipv4Addr::from_str(&triple.ip_address) {
            self.state.lock().await.allocated_ips.remove(&ip);
        }
    }

    fn lowest_free_ip(&self, allocated: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let network_u32 = u32::from(self.network);
        let host_bits = 32 - self.prefix_len as u32;
        let broadcast_u32 = network_u32 | ((1u32 << host_bits) - 1);

        // Reserve the network address, the broadcast address, the host's
        // own address, and a small head of the range for infrastructure.
        const RESERVED_HEAD: u32 = 2;
        for candidate in (network_u32 + 1 + RESERVED_HEAD)..broadcast_u32 {
            let candidate_ip = Ipv4Addr::from(candidate);
            if candidate_ip == self.host_ip {
                continue;
            }
            if !allocated.contains(&candidate_ip) {
                return Some(candidate_ip);
            }
        }
        None
    }

    async fn create_tap_device(&self, name: &str) -> Result<()> {
        run_ip(&["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        run_ip(&["link", "set", "dev", name, "master", &self.bridge_name]).await?;
        run_ip(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn delete_tap_device(&self, name: &str) -> Result<()> {
        run_ip(&["link", "delete", name]).await
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::HostOp(format!("failed to spawn `ip {}`: {e}", args.join(" "))))?;

    if !output.status.success() {
        return Err(Error::HostOp(format!(
            "`ip {}` failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| Error::HostOp(format!("invalid subnet cidr: {cidr}")))?;
    let network = Ipv4Addr::from_str(addr).map_err(|e| Error::HostOp(format!("invalid subnet cidr: {e}")))?;
    let prefix_len: u8 = len
        .parse()
        .map_err(|e| Error::HostOp(format!("invalid subnet prefix: {e}")))?;
    Ok((network, prefix_len))
}

/// Derives a locally-administered MAC from the guest IP so that uniqueness
/// follows directly from IP uniqueness: `02:FC:<4 octets of IP>`.
fn mac_from_ip(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "02:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NetworkSettings {
        NetworkSettings {
            bridge_name: "vmdbr0".into(),
            subnet: "192.168.127.0/24".into(),
            host_ip: "192.168.127.1".into(),
            tap_prefix: "vmtap".into(),
        }
    }

    #[test]
    fn mac_is_derived_deterministically_from_ip() {
        let ip = Ipv4Addr::new(192, 168, 127, 5);
        assert_eq!(mac_from_ip(ip), "02:FC:C0:A8:7F:05");
    }

    #[test]
    fn lowest_free_ip_skips_host_and_reserved_head() {
        let allocator = NetworkAllocator::new(&settings()).unwrap();
        let ip = allocator.lowest_free_ip(&HashSet::new()).unwrap();
        assert_ne!(ip, allocator.host_ip);
        assert!(u32::from(ip) > u32::from(allocator.network) + 2);
    }

    #[test]
    fn lowest_free_ip_is_exhausted_when_subnet_full() {
        let allocator = NetworkAllocator::new(&settings()).unwrap();
        let network_u32 = u32::from(allocator.network);
        let mut all = HashSet::new();
        for i in (network_u32 + 1)..(network_u32 + 255) {
            all.insert(Ipv4Addr::from(i));
        }
        assert_eq!(allocator.lowest_free_ip(&all), None);
    }
}
