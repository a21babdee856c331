//! Wi-Fi profile store collaborator backing Object 12, grounded on
//! `ig60_wlan.py`'s NetworkManager connection-settings
//! round trip: a profile is a `lwm2m_conn_<instance>` NM connection,
//! created/modified/deleted wholesale rather than field-by-field.

use async_trait::async_trait;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WifiProfile {
    pub interface: String,
    pub enabled: bool,
    pub ssid: String,
    pub channel: u16,
    /// `true` for WPA-PSK, `false` for open — Object 12 has no field
    /// for EAP credentials, so only these two auth modes are modeled.
    pub psk_auth: bool,
    pub psk: String,
}

#[async_trait]
pub trait WifiProfileStore: Send + Sync {
    /// Instance ids of existing `lwm2m_conn_*` connections on the given
    /// interface, read back at object-base construction time.
    async fn list_profiles(&self, interface: &str) -> Vec<u32>;

    async fn read_profile(&self, instance: u32) -> Option<WifiProfile>;

    /// Create-or-modify — NetworkManager itself has no separate create
    /// verb, so neither does this trait.
    async fn write_profile(&self, instance: u32, profile: &WifiProfile) -> bool;

    async fn delete_profile(&self, instance: u32) -> bool;

    async fn hw_addr(&self, interface: &str) -> Option<[u8; 6]>;

    /// Whether the connection is presently the active one for its
    /// interface — distinguishes `up` from `disabled`/`error` (spec
    /// §4.7 WLAN status resource).
    async fn is_connection_active(&self, instance: u32) -> bool;
}

#[cfg(feature = "dbus")]
pub mod dbus_backed {
    use super::*;
    use zbus::Connection as ZbusConnection;

    const NM_BUS: &str = "org.freedesktop.NetworkManager";

    pub struct DbusWifiProfileStore {
        bus: ZbusConnection,
    }

    impl DbusWifiProfileStore {
        pub async fn connect() -> zbus::Result<DbusWifiProfileStore> {
            Ok(DbusWifiProfileStore {
                bus: ZbusConnection::system().await?,
            })
        }

        fn connection_id(instance: u32) -> String {
            format!("{}{instance}", crate::constants::WLAN_PROFILE_PREFIX)
        }
    }

    #[async_trait]
    impl WifiProfileStore for DbusWifiProfileStore {
        async fn list_profiles(&self, interface: &str) -> Vec<u32> {
            let settings = match zbus::Proxy::new(
                &self.bus,
                NM_BUS,
                "/org/freedesktop/NetworkManager/Settings",
                "org.freedesktop.NetworkManager.Settings",
            )
            .await
            {
                Ok(p) => p,
                Err(_) => return Vec::new(),
            };
            let connections: Vec<zbus::zvariant::OwnedObjectPath> = match settings.call_method("ListConnections", &()).await {
                Ok(reply) => reply.body().unwrap_or_default(),
                Err(_) => return Vec::new(),
            };
            let mut ids = Vec::new();
            for path in connections {
                if let Some(instance) = connection_instance_if_on_interface(&self.bus, &path, interface).await {
                    ids.push(instance);
                }
            }
            ids
        }

        async fn read_profile(&self, instance: u32) -> Option<WifiProfile> {
            let id = Self::connection_id(instance);
            let (path, settings) = find_connection_by_id(&self.bus, &id).await?;

            let connection = settings.get("connection")?;
            let interface = connection
                .get("interface-name")
                .and_then(|v| v.downcast_ref::<&str>().ok())
                .map(str::to_string)
                .unwrap_or_default();
            let enabled = connection.get("autoconnect").and_then(|v| v.downcast_ref::<bool>().ok()).unwrap_or(true);

            let wireless = settings.get("802-11-wireless");
            let ssid = wireless
                .and_then(|w| w.get("ssid"))
                .and_then(|v| v.downcast_ref::<Vec<u8>>().ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            let channel = wireless
                .and_then(|w| w.get("channel"))
                .and_then(|v| v.downcast_ref::<u32>().ok())
                .map(|c| c as u16)
                .unwrap_or(0);

            let security = settings.get("802-11-wireless-security");
            let psk_auth = security
                .and_then(|s| s.get("key-mgmt"))
                .and_then(|v| v.downcast_ref::<&str>().ok())
                .map(|key_mgmt| key_mgmt == "wpa-psk")
                .unwrap_or(false);
            let psk = if psk_auth {
                fetch_secret(&self.bus, &path, "802-11-wireless-security", "psk").await.unwrap_or_default()
            } else {
                String::new()
            };

            Some(WifiProfile { interface, enabled, ssid, channel, psk_auth, psk })
        }

        async fn write_profile(&self, instance: u32, profile: &WifiProfile) -> bool {
            let id = Self::connection_id(instance);
            let settings = profile_to_settings(&id, profile);

            if let Some((path, _)) = find_connection_by_id(&self.bus, &id).await {
                let Ok(proxy) = zbus::Proxy::new(&self.bus, NM_BUS, path.as_str(), "org.freedesktop.NetworkManager.Settings.Connection").await
                else {
                    return false;
                };
                proxy.call_method("Update", &(settings,)).await.is_ok()
            } else {
                let Ok(proxy) = zbus::Proxy::new(&self.bus, NM_BUS, "/org/freedesktop/NetworkManager/Settings", "org.freedesktop.NetworkManager.Settings").await
                else {
                    return false;
                };
                proxy.call_method("AddConnection", &(settings,)).await.is_ok()
            }
        }

        async fn delete_profile(&self, instance: u32) -> bool {
            let id = Self::connection_id(instance);
            let Some((path, _)) = find_connection_by_id(&self.bus, &id).await else {
                return false;
            };
            let Ok(proxy) = zbus::Proxy::new(&self.bus, NM_BUS, path.as_str(), "org.freedesktop.NetworkManager.Settings.Connection").await
            else {
                return false;
            };
            proxy.call_method("Delete", &()).await.is_ok()
        }

        async fn hw_addr(&self, interface: &str) -> Option<[u8; 6]> {
            let contents = std::fs::read_to_string(format!("/sys/class/net/{interface}/address")).ok()?;
            let mut out = [0u8; 6];
            for (i, byte) in contents.trim().split(':').enumerate().take(6) {
                out[i] = u8::from_str_radix(byte, 16).ok()?;
            }
            Some(out)
        }

        async fn is_connection_active(&self, instance: u32) -> bool {
            let id = Self::connection_id(instance);
            let Ok(proxy) = zbus::Proxy::new(&self.bus, NM_BUS, "/org/freedesktop/NetworkManager", "org.freedesktop.NetworkManager").await
            else {
                return false;
            };
            let Ok(active): Result<Vec<zbus::zvariant::OwnedObjectPath>, _> = proxy.get_property("ActiveConnections").await else {
                return false;
            };
            for path in active {
                let Ok(props) = zbus::Proxy::new(&self.bus, NM_BUS, path.as_str(), "org.freedesktop.DBus.Properties").await else {
                    continue;
                };
                let active_id: Result<String, _> = props
                    .call_method("Get", &("org.freedesktop.NetworkManager.Connection.Active", "Id"))
                    .await
                    .and_then(|r| r.body());
                if active_id.as_deref() == Ok(id.as_str()) {
                    return true;
                }
            }
            false
        }
    }

    type NmSettings = std::collections::HashMap<String, std::collections::HashMap<String, zbus::zvariant::OwnedValue>>;

    async fn connection_instance_if_on_interface(
        bus: &ZbusConnection,
        path: &zbus::zvariant::OwnedObjectPath,
        interface: &str,
    ) -> Option<u32> {
        let proxy = zbus::Proxy::new(bus, NM_BUS, path.as_str(), "org.freedesktop.NetworkManager.Settings.Connection")
            .await
            .ok()?;
        let settings: NmSettings = proxy.call_method("GetSettings", &()).await.ok()?.body().ok()?;
        let conn = settings.get("connection")?;
        let iface: &str = conn.get("interface-name")?.downcast_ref().ok()?;
        if iface != interface {
            return None;
        }
        let id: &str = conn.get("id")?.downcast_ref().ok()?;
        id.strip_prefix(crate::constants::WLAN_PROFILE_PREFIX)?.parse().ok()
    }

    /// Scans every NetworkManager connection for one whose `connection.id`
    /// matches `id`, the same linear walk `list_profiles` already does by
    /// interface rather than by id.
    async fn find_connection_by_id(bus: &ZbusConnection, id: &str) -> Option<(zbus::zvariant::OwnedObjectPath, NmSettings)> {
        let settings_proxy = zbus::Proxy::new(bus, NM_BUS, "/org/freedesktop/NetworkManager/Settings", "org.freedesktop.NetworkManager.Settings")
            .await
            .ok()?;
        let connections: Vec<zbus::zvariant::OwnedObjectPath> = settings_proxy.call_method("ListConnections", &()).await.ok()?.body().ok()?;
        for path in connections {
            let proxy = zbus::Proxy::new(bus, NM_BUS, path.as_str(), "org.freedesktop.NetworkManager.Settings.Connection").await.ok()?;
            let Ok(settings): Result<NmSettings, _> = proxy.call_method("GetSettings", &()).await.and_then(|r| r.body()) else {
                continue;
            };
            let matches = settings
                .get("connection")
                .and_then(|c| c.get("id"))
                .and_then(|v| v.downcast_ref::<&str>().ok())
                .map(|existing_id| existing_id == id)
                .unwrap_or(false);
            if matches {
                return Some((path, settings));
            }
        }
        None
    }

    async fn fetch_secret(bus: &ZbusConnection, path: &zbus::zvariant::OwnedObjectPath, setting_name: &str, key: &str) -> Option<String> {
        let proxy = zbus::Proxy::new(bus, NM_BUS, path.as_str(), "org.freedesktop.NetworkManager.Settings.Connection").await.ok()?;
        let secrets: NmSettings = proxy.call_method("GetSecrets", &(setting_name,)).await.ok()?.body().ok()?;
        secrets.get(setting_name)?.get(key)?.downcast_ref::<&str>().ok().map(str::to_string)
    }

    /// Builds the `a{sa{sv}}` settings map NetworkManager's
    /// `Update`/`AddConnection` expect, mirroring the groups
    /// `ig60_wlan.py` writes for a `lwm2m_conn_<instance>` profile.
    fn profile_to_settings(id: &str, profile: &WifiProfile) -> NmSettings {
        use zbus::zvariant::Value;

        let mut connection = std::collections::HashMap::new();
        connection.insert("id".to_string(), Value::from(id).try_into().unwrap());
        connection.insert("type".to_string(), Value::from("802-11-wireless").try_into().unwrap());
        connection.insert("interface-name".to_string(), Value::from(profile.interface.as_str()).try_into().unwrap());
        connection.insert("autoconnect".to_string(), Value::from(profile.enabled).try_into().unwrap());

        let mut wireless = std::collections::HashMap::new();
        wireless.insert("ssid".to_string(), Value::from(profile.ssid.as_bytes().to_vec()).try_into().unwrap());
        wireless.insert("mode".to_string(), Value::from("infrastructure").try_into().unwrap());
        wireless.insert("channel".to_string(), Value::from(profile.channel as u32).try_into().unwrap());

        let mut settings = std::collections::HashMap::new();
        settings.insert("connection".to_string(), connection);
        settings.insert("802-11-wireless".to_string(), wireless);

        if profile.psk_auth {
            let mut security = std::collections::HashMap::new();
            security.insert("key-mgmt".to_string(), Value::from("wpa-psk").try_into().unwrap());
            security.insert("psk".to_string(), Value::from(profile.psk.as_str()).try_into().unwrap());
            settings.insert("802-11-wireless-security".to_string(), security);
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_default_is_open_and_disabled() {
        let profile = WifiProfile::default();
        assert!(!profile.enabled);
        assert!(!profile.psk_auth);
    }
}
