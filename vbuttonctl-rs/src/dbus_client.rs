/* vbuttonctl DBus client: thin wrapper over the org.asterics.vbutton1 Manager interface,
 * reading its properties and calling its methods with raw messages. */
//! Low-level DBus client for `org.asterics.vbutton1`.
//!
//! All communication with the daemon goes through this module.

use anyhow::{anyhow, Context, Result};
use zbus::zvariant::{OwnedValue, Value};
use zbus::Connection;

const BUS_NAME: &str = "org.asterics.vbutton1";
const MANAGER_PATH: &str = "/org/asterics/vbutton1";
const MANAGER_IFACE: &str = "org.asterics.vbutton1.Manager";

/// A client that talks to the `vbuttond` daemon.
pub struct VButtonClient {
    conn: Connection,
}

impl VButtonClient {
    /// Connect to the system bus, or the session bus when `session` is set.
    pub async fn connect(session: bool) -> Result<Self> {
        let conn = if session {
            Connection::session().await.context("Cannot connect to the session DBus")?
        } else {
            Connection::system().await.context("Cannot connect to the system DBus")?
        };
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub async fn get_api_version(&self) -> Result<i32> {
        let val = self.get_property("APIVersion").await?;
        val.downcast_ref::<i32>().context("Type mismatch for APIVersion")
    }

    /// Name of the active slot, empty if none has been applied yet.
    pub async fn active_slot(&self) -> Result<String> {
        let val = self.get_property("ActiveSlot").await?;
        val.downcast_ref::<String>().context("Type mismatch for ActiveSlot")
    }

    /// Slot names, indexed by slot number.
    pub async fn slots(&self) -> Result<Vec<String>> {
        let val = self.get_property("Slots").await?;
        extract_string_array(val).context("Failed to parse Slots property")
    }

    pub async fn infrared_recordings(&self) -> Result<Vec<String>> {
        let val = self.get_property("InfraredRecordings").await?;
        extract_string_array(val).context("Failed to parse InfraredRecordings property")
    }

    /// HID transports ("usb", "ble") the running slot routes to.
    pub async fn transports(&self) -> Result<Vec<String>> {
        let val = self.get_property("Transports").await?;
        extract_string_array(val).context("Failed to parse Transports property")
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    /// Request a slot switch; returns the slot active afterwards.
    pub async fn switch(&self, token: &str) -> Result<String> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "Switch", &(token,))
            .await
            .with_context(|| format!("Switch to '{}' failed", token))?;
        let active: String = reply.body().deserialize()?;
        Ok(active)
    }

    pub async fn delete_slot(&self, name: &str) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "DeleteSlot", &(name,))
            .await
            .with_context(|| format!("DeleteSlot '{}' failed", name))?;
        Ok(())
    }

    /// Inject a raw edge: `kind` is "press", "release" or "ambiguous".
    pub async fn inject_edge(&self, vb: u32, kind: &str) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "InjectEdge", &(vb, kind))
            .await
            .with_context(|| format!("InjectEdge {} {} failed", vb, kind))?;
        Ok(())
    }

    pub async fn bindings(&self, vb: u32) -> Result<Vec<String>> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "Bindings", &(vb,))
            .await
            .with_context(|| format!("Bindings for VB {} failed", vb))?;
        let lines: Vec<String> = reply.body().deserialize()?;
        Ok(lines)
    }

    /// Save the staged (else running) configuration as `name`; returns its slot number.
    pub async fn store_slot(&self, name: &str) -> Result<u32> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "StoreSlot", &(name,))
            .await
            .with_context(|| format!("StoreSlot '{}' failed", name))?;
        let number: u32 = reply.body().deserialize()?;
        Ok(number)
    }

    /// Stage a configuration for the next UPDATE: (button, JSON action) pairs.
    pub async fn stage_update(&self, name: &str, actions: &[(u32, String)]) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "StageUpdate", &(name, actions))
            .await
            .with_context(|| format!("StageUpdate '{}' failed", name))?;
        Ok(())
    }

    pub async fn bind(&self, vb: u32, action: &str, replace: bool) -> Result<u32> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "Bind", &(vb, action, replace))
            .await
            .with_context(|| format!("Bind VB {} failed", vb))?;
        let added: u32 = reply.body().deserialize()?;
        Ok(added)
    }

    pub async fn unbind(&self, vb: u32) -> Result<u32> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "Unbind", &(vb,))
            .await
            .with_context(|| format!("Unbind VB {} failed", vb))?;
        let removed: u32 = reply.body().deserialize()?;
        Ok(removed)
    }

    pub async fn fire(&self, action: &str) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "Fire", &(action,))
            .await
            .context("Fire failed")?;
        Ok(())
    }

    /// Buttons and edges an action is bound to.
    pub async fn find_binding(&self, action: &str) -> Result<Vec<(u32, String)>> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "FindBinding", &(action,))
            .await
            .context("FindBinding failed")?;
        let hits: Vec<(u32, String)> = reply.body().deserialize()?;
        Ok(hits)
    }

    pub async fn bound_buttons(&self) -> Result<Vec<u32>> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "BoundButtons", &())
            .await
            .context("BoundButtons failed")?;
        let buttons: Vec<u32> = reply.body().deserialize()?;
        Ok(buttons)
    }

    /// Entry counts of the HID chain and the general action chain.
    pub async fn chain_sizes(&self) -> Result<(u32, u32)> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "ChainSizes", &())
            .await
            .context("ChainSizes failed")?;
        let sizes: (u32, u32) = reply.body().deserialize()?;
        Ok(sizes)
    }

    pub async fn store_infrared(&self, name: &str, items: &[u32]) -> Result<u32> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "StoreInfrared", &(name, items))
            .await
            .with_context(|| format!("StoreInfrared '{}' failed", name))?;
        let number: u32 = reply.body().deserialize()?;
        Ok(number)
    }

    pub async fn delete_infrared(&self, name: &str) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "DeleteInfrared", &(name,))
            .await
            .with_context(|| format!("DeleteInfrared '{}' failed", name))?;
        Ok(())
    }

    pub async fn has_secret(&self, key: &str) -> Result<bool> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "HasSecret", &(key,))
            .await
            .with_context(|| format!("HasSecret '{}' failed", key))?;
        let set: bool = reply.body().deserialize()?;
        Ok(set)
    }

    pub async fn remove_secret(&self, key: &str) -> Result<bool> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "RemoveSecret", &(key,))
            .await
            .with_context(|| format!("RemoveSecret '{}' failed", key))?;
        let removed: bool = reply.body().deserialize()?;
        Ok(removed)
    }

    pub async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .call_method(Some(BUS_NAME), MANAGER_PATH, Some(MANAGER_IFACE), "SetSecret", &(key, value))
            .await
            .with_context(|| format!("SetSecret '{}' failed", key))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generic helpers
    // -----------------------------------------------------------------------

    async fn get_property(&self, prop: &str) -> Result<OwnedValue> {
        let reply = self
            .conn
            .call_method(
                Some(BUS_NAME),
                MANAGER_PATH,
                Some("org.freedesktop.DBus.Properties"),
                "Get",
                &(MANAGER_IFACE, prop),
            )
            .await
            .with_context(|| format!("Get {}.{} failed", MANAGER_IFACE, prop))?;
        let val: OwnedValue = reply.body().deserialize()?;
        Ok(val)
    }
}

/// Extract a `Vec<String>` from an `OwnedValue` that wraps an array of strings.
fn extract_string_array(val: OwnedValue) -> Result<Vec<String>> {
    let inner: Value<'_> = val.into();
    match inner {
        Value::Array(arr) => {
            let mut out = Vec::with_capacity(arr.len());
            for item in arr.iter() {
                match item {
                    Value::Str(s) => out.push(s.to_string()),
                    _ => return Err(anyhow!("Array contains non-string value")),
                }
            }
            Ok(out)
        }
        _ => Err(anyhow!("Value is not an array of strings")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_string_array() {
        let val = OwnedValue::try_from(Value::from(vec!["mouse", "keyboard"])).unwrap();
        assert_eq!(extract_string_array(val).unwrap(), ["mouse", "keyboard"]);
    }

    #[test]
    fn test_extract_rejects_non_strings() {
        let val = OwnedValue::try_from(Value::from(vec![1u32, 2])).unwrap();
        assert!(extract_string_array(val).is_err());
        let val = OwnedValue::try_from(Value::from("mouse")).unwrap();
        assert!(extract_string_array(val).is_err());
    }
}
