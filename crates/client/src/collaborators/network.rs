//! Network-info and cellular-info collaborators, grounded on
//! `ig60_network.py`'s NetworkManager/oFono D-Bus calls. The D-Bus
//! bindings themselves are out of scope — `zbus` is called into,
//! never reimplemented, and only compiled in behind the `dbus`
//! feature, mirroring the original's `try: import dbus except: pass`.

use async_trait::async_trait;

/// One active NetworkManager connection as `get_available_connections`
/// reports it: interface name, connection id, and its bound addresses.
#[derive(Debug, Clone)]
pub struct Connection {
    pub interface: String,
    pub connection_id: String,
    pub ipv4_addresses: Vec<String>,
    pub ipv6_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CellularNetworkProps {
    pub rssi_percent: Option<u8>,
    pub cell_id: Option<i64>,
    pub mcc: Option<i64>,
    pub mnc: Option<i64>,
    pub lac: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CellularConnectionProps {
    pub apn: Option<String>,
    pub address: Option<String>,
    pub gateway: Option<String>,
    pub netmask: Option<String>,
    pub dns: Vec<String>,
}

/// RSSI percent (0-100, oFono's own scale) to dBm.
pub fn rssi_percent_to_dbm(pct: u8) -> f64 {
    -112.0 + (pct as f64 / 20.0) * 15.0
}

#[async_trait]
pub trait NetworkInfo: Send + Sync {
    async fn available_connections(&self) -> Vec<Connection>;
    async fn find_iface_by_addr(&self, addr: &str) -> Option<String>;
    async fn hw_addr(&self, interface: &str) -> Option<[u8; 6]>;
}

#[async_trait]
pub trait CellularInfo: Send + Sync {
    async fn network_props(&self) -> CellularNetworkProps;
    async fn connection_props(&self) -> CellularConnectionProps;
    async fn get_lte_prop(&self, name: &str) -> Option<String>;
    async fn set_lte_prop(&self, name: &str, value: &str) -> bool;
}

#[cfg(feature = "dbus")]
pub mod dbus_backed {
    use super::*;
    use zbus::Connection as ZbusConnection;

    const NM_BUS: &str = "org.freedesktop.NetworkManager";
    const OFONO_BUS: &str = "org.ofono";

    /// NetworkManager/oFono-backed implementation. Each call opens (or
    /// reuses) a system-bus connection and reads the same properties
    /// `ig60_network.py` reads; a bus error degrades to an empty/`None`
    /// result rather than propagating, matching the original's
    /// try/except-and-log-a-warning shape.
    pub struct DbusNetwork {
        bus: ZbusConnection,
    }

    impl DbusNetwork {
        pub async fn connect() -> zbus::Result<DbusNetwork> {
            let bus = ZbusConnection::system().await?;
            Ok(DbusNetwork { bus })
        }
    }

    #[async_trait]
    impl NetworkInfo for DbusNetwork {
        async fn available_connections(&self) -> Vec<Connection> {
            match list_active_connections(&self.bus).await {
                Ok(conns) => conns,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to enumerate NetworkManager connections over D-Bus");
                    Vec::new()
                }
            }
        }

        async fn find_iface_by_addr(&self, addr: &str) -> Option<String> {
            self.available_connections()
                .await
                .into_iter()
                .find(|c| c.ipv4_addresses.iter().any(|a| a == addr) || c.ipv6_addresses.iter().any(|a| a == addr))
                .map(|c| c.interface)
        }

        async fn hw_addr(&self, interface: &str) -> Option<[u8; 6]> {
            hw_addr_via_sysfs(interface)
        }
    }

    async fn list_active_connections(bus: &ZbusConnection) -> zbus::Result<Vec<Connection>> {
        let proxy = zbus::Proxy::new(
            bus,
            NM_BUS,
            "/org/freedesktop/NetworkManager",
            "org.freedesktop.NetworkManager",
        )
        .await?;
        let active: Vec<zbus::zvariant::OwnedObjectPath> = proxy.get_property("ActiveConnections").await?;
        let mut out = Vec::new();
        for path in active {
            if let Ok(conn) = describe_active_connection(bus, &path).await {
                out.push(conn);
            }
        }
        Ok(out)
    }

    async fn describe_active_connection(
        bus: &ZbusConnection,
        path: &zbus::zvariant::OwnedObjectPath,
    ) -> zbus::Result<Connection> {
        let props = zbus::Proxy::new(bus, NM_BUS, path.as_str(), "org.freedesktop.DBus.Properties").await?;
        let state: u32 = props
            .call_method(
                "Get",
                &("org.freedesktop.NetworkManager.Connection.Active", "State"),
            )
            .await?
            .body()?;
        let connection_id: String = props
            .call_method("Get", &("org.freedesktop.NetworkManager.Connection.Active", "Id"))
            .await?
            .body()?;
        let devices: Vec<zbus::zvariant::OwnedObjectPath> = props
            .call_method(
                "Get",
                &("org.freedesktop.NetworkManager.Connection.Active", "Devices"),
            )
            .await?
            .body()?;
        let interface = match devices.first() {
            Some(dev_path) => {
                let dev_props = zbus::Proxy::new(bus, NM_BUS, dev_path.as_str(), "org.freedesktop.DBus.Properties").await?;
                dev_props
                    .call_method("Get", &("org.freedesktop.NetworkManager.Device", "Interface"))
                    .await?
                    .body()?
            }
            None => String::new(),
        };
        // NM_ACTIVE_CONNECTION_STATE_ACTIVATED == 2
        let (ipv4_addresses, ipv6_addresses) = if state == 2 {
            let ipv4 = ip_config_addresses(bus, &props, "Ip4Config", "org.freedesktop.NetworkManager.IP4Config")
                .await
                .unwrap_or_default();
            let ipv6 = ip_config_addresses(bus, &props, "Ip6Config", "org.freedesktop.NetworkManager.IP6Config")
                .await
                .unwrap_or_default();
            (ipv4, ipv6)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(Connection {
            interface,
            connection_id,
            ipv4_addresses,
            ipv6_addresses,
        })
    }

    /// Reads the bound addresses off the Active connection's
    /// Ip4Config/Ip6Config object, the same `AddressData` walk
    /// `ig60_network.py::get_available_connections` does once it has
    /// the config object path in hand.
    async fn ip_config_addresses(
        bus: &ZbusConnection,
        active_props: &zbus::Proxy<'_>,
        config_property: &str,
        config_interface: &str,
    ) -> zbus::Result<Vec<String>> {
        let config_path: zbus::zvariant::OwnedObjectPath = active_props
            .call_method(
                "Get",
                &("org.freedesktop.NetworkManager.Connection.Active", config_property),
            )
            .await?
            .body()?;
        if config_path.as_str() == "/" {
            return Ok(Vec::new());
        }
        let config_props = zbus::Proxy::new(bus, NM_BUS, config_path.as_str(), "org.freedesktop.DBus.Properties").await?;
        let address_data: Vec<std::collections::HashMap<String, zbus::zvariant::OwnedValue>> = config_props
            .call_method("Get", &(config_interface, "AddressData"))
            .await?
            .body()?;
        Ok(address_data
            .into_iter()
            .filter_map(|entry| entry.get("address").and_then(|v| v.downcast_ref::<&str>().ok()).map(str::to_string))
            .collect())
    }

    fn hw_addr_via_sysfs(interface: &str) -> Option<[u8; 6]> {
        let contents = std::fs::read_to_string(format!("/sys/class/net/{interface}/address")).ok()?;
        let mut out = [0u8; 6];
        for (i, byte) in contents.trim().split(':').enumerate().take(6) {
            out[i] = u8::from_str_radix(byte, 16).ok()?;
        }
        Some(out)
    }

    /// oFono-backed cellular info. The modem path is re-resolved on
    /// every call the way `ig60_network.py::get_ofono_net_props` does
    /// (`GetModems()[0]`), rather than cached, since a modem can come
    /// and go across the client's lifetime.
    pub struct DbusCellular {
        bus: ZbusConnection,
    }

    impl DbusCellular {
        pub async fn connect() -> zbus::Result<DbusCellular> {
            let bus = ZbusConnection::system().await?;
            Ok(DbusCellular { bus })
        }

        async fn first_modem(&self) -> zbus::Result<String> {
            let manager = zbus::Proxy::new(&self.bus, OFONO_BUS, "/", "org.ofono.Manager").await?;
            let modems: Vec<(zbus::zvariant::OwnedObjectPath, std::collections::HashMap<String, zbus::zvariant::OwnedValue>)> =
                manager.call_method("GetModems", &()).await?.body()?;
            modems
                .into_iter()
                .next()
                .map(|(path, _)| path.to_string())
                .ok_or_else(|| zbus::Error::Failure("no oFono modem present".into()))
        }
    }

    #[async_trait]
    impl CellularInfo for DbusCellular {
        async fn network_props(&self) -> CellularNetworkProps {
            let Ok(modem) = self.first_modem().await else {
                return CellularNetworkProps::default();
            };
            let Ok(proxy) = zbus::Proxy::new(&self.bus, OFONO_BUS, modem.as_str(), "org.ofono.NetworkRegistration").await else {
                return CellularNetworkProps::default();
            };
            let props: std::collections::HashMap<String, zbus::zvariant::OwnedValue> =
                match proxy.call_method("GetProperties", &()).await.and_then(|r| r.body()) {
                    Ok(props) => props,
                    Err(_) => return CellularNetworkProps::default(),
                };
            CellularNetworkProps {
                rssi_percent: props.get("Strength").and_then(|v| v.downcast_ref::<u8>().ok()),
                cell_id: props.get("CellId").and_then(|v| v.downcast_ref::<u32>().ok()).map(i64::from),
                mcc: props
                    .get("MobileCountryCode")
                    .and_then(|v| v.downcast_ref::<&str>().ok())
                    .and_then(|s| s.parse().ok()),
                mnc: props
                    .get("MobileNetworkCode")
                    .and_then(|v| v.downcast_ref::<&str>().ok())
                    .and_then(|s| s.parse().ok()),
                lac: props.get("LocationAreaCode").and_then(|v| v.downcast_ref::<u16>().ok()).map(i64::from),
            }
        }

        async fn connection_props(&self) -> CellularConnectionProps {
            let Ok(modem) = self.first_modem().await else {
                return CellularConnectionProps::default();
            };
            let Ok(proxy) = zbus::Proxy::new(&self.bus, OFONO_BUS, modem.as_str(), "org.ofono.ConnectionManager").await else {
                return CellularConnectionProps::default();
            };
            let contexts: Vec<(
                zbus::zvariant::OwnedObjectPath,
                std::collections::HashMap<String, zbus::zvariant::OwnedValue>,
            )> = match proxy.call_method("GetContexts", &()).await.and_then(|r| r.body()) {
                Ok(contexts) => contexts,
                Err(_) => return CellularConnectionProps::default(),
            };
            let Some((_, ctx_props)) = contexts.into_iter().next() else {
                return CellularConnectionProps::default();
            };
            let apn = ctx_props.get("AccessPointName").and_then(|v| v.downcast_ref::<&str>().ok()).map(str::to_string);
            let settings = ctx_props
                .get("Settings")
                .and_then(|v| v.downcast_ref::<std::collections::HashMap<String, zbus::zvariant::OwnedValue>>().ok());
            let (address, gateway, netmask, dns) = match settings {
                Some(settings) => (
                    settings.get("Address").and_then(|v| v.downcast_ref::<&str>().ok()).map(str::to_string),
                    settings.get("Gateway").and_then(|v| v.downcast_ref::<&str>().ok()).map(str::to_string),
                    settings.get("Netmask").and_then(|v| v.downcast_ref::<&str>().ok()).map(str::to_string),
                    settings
                        .get("DomainNameServers")
                        .and_then(|v| v.downcast_ref::<Vec<String>>().ok())
                        .unwrap_or_default(),
                ),
                None => (None, None, None, Vec::new()),
            };
            CellularConnectionProps { apn, address, gateway, netmask, dns }
        }

        async fn get_lte_prop(&self, name: &str) -> Option<String> {
            let modem = self.first_modem().await.ok()?;
            let proxy = zbus::Proxy::new(&self.bus, OFONO_BUS, modem.as_str(), "org.ofono.LongTermEvolution")
                .await
                .ok()?;
            let props: std::collections::HashMap<String, zbus::zvariant::OwnedValue> =
                proxy.call_method("GetProperties", &()).await.ok()?.body().ok()?;
            props.get(name).and_then(|v| v.downcast_ref::<&str>().ok().map(str::to_string))
        }

        async fn set_lte_prop(&self, name: &str, value: &str) -> bool {
            let Ok(modem) = self.first_modem().await else {
                return false;
            };
            let Ok(proxy) = zbus::Proxy::new(&self.bus, OFONO_BUS, modem.as_str(), "org.ofono.LongTermEvolution").await else {
                return false;
            };
            proxy
                .call_method("SetProperty", &(name, zbus::zvariant::Value::from(value)))
                .await
                .is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_conversion_matches_spec_formula() {
        assert_eq!(rssi_percent_to_dbm(100), 63.0);
        assert_eq!(rssi_percent_to_dbm(0), -112.0);
    }
}
