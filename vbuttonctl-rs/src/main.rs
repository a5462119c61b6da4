/* vbuttonctl CLI: clap-driven client that talks to vbuttond over DBus to manage slots,
 * edit live bindings, inject virtual button edges and inspect what a button is bound to. */
mod dbus_client;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use dbus_client::VButtonClient;

/// vbuttonctl: drive the vbuttond virtual button daemon over DBus.
#[derive(Parser)]
#[command(name = "vbuttonctl", version, about)]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored slots.
    List,

    /// Show the daemon's API version, active slot and storage summary.
    Info,

    /// Switch to a slot by name, or NEXT/PREV/DEFAULT/UPDATE/RESTOREFACTORY.
    Switch {
        token: String,
    },

    /// Switch to the next slot (wraps around).
    Next,

    /// Switch to the previous slot (wraps around).
    Prev,

    /// Switch to slot 0, creating the factory slot on an empty store.
    Default,

    /// Delete every slot and store the factory slot.
    #[command(name = "restore-factory")]
    RestoreFactory,

    /// Delete a slot by name.
    Delete {
        name: String,
    },

    /// Save the staged (else running) configuration as a slot.
    Store {
        name: String,
    },

    /// Stage a configuration for the next `switch UPDATE`.
    Stage {
        name: String,
        /// Bindings as VB=JSON, e.g. '4={"kind":"mouse_click","param":"right"}'.
        #[arg(value_parser = parse_binding)]
        bindings: Vec<(u32, String)>,
    },

    /// Bind a JSON action to a button in the running configuration.
    Bind {
        vb: u32,
        action: String,
        /// Drop what the button was bound to first.
        #[arg(long)]
        replace: bool,
    },

    /// Remove everything bound to a button in the running configuration.
    Unbind {
        vb: u32,
    },

    /// Run a JSON action once without binding it.
    Fire {
        action: String,
    },

    /// Show which buttons a JSON action is bound to.
    #[command(name = "find-binding")]
    FindBinding {
        action: String,
    },

    /// Inject a press edge.
    Press {
        /// Virtual button number.
        vb: u32,
    },

    /// Inject a release edge.
    Release {
        /// Virtual button number.
        vb: u32,
    },

    /// Press, hold, then release.
    Tap {
        /// Virtual button number.
        vb: u32,
        /// Hold time in ms; must exceed the button's debounce time.
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },

    /// Show the chain entries bound to a virtual button.
    Bindings {
        /// Virtual button number.
        vb: u32,
    },

    /// Store a global key/value string (e.g. the WiFi passphrase).
    #[command(name = "set-secret")]
    SetSecret {
        key: String,
        value: String,
    },

    /// Tell whether a global key/value string is set.
    #[command(name = "has-secret")]
    HasSecret {
        key: String,
    },

    /// Remove a global key/value string.
    #[command(name = "remove-secret")]
    RemoveSecret {
        key: String,
    },

    /// Infrared recording commands.
    #[command(subcommand)]
    Ir(IrCmd),
}

#[derive(Subcommand)]
enum IrCmd {
    /// List stored infrared recordings.
    List,

    /// Store a recording from packed edge items (decimal or 0x-prefixed hex).
    Store {
        name: String,
        #[arg(value_parser = parse_item, required = true)]
        items: Vec<u32>,
    },

    /// Delete a recording by name.
    Delete {
        name: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = VButtonClient::connect(cli.session)
        .await
        .context("Failed to connect to vbuttond on org.asterics.vbutton1")?;

    match cli.command {
        Commands::List => cmd_list(&client).await,
        Commands::Info => cmd_info(&client).await,
        Commands::Switch { token } => cmd_switch(&client, &token).await,
        Commands::Next => cmd_switch(&client, "NEXT").await,
        Commands::Prev => cmd_switch(&client, "PREV").await,
        Commands::Default => cmd_switch(&client, "DEFAULT").await,
        Commands::RestoreFactory => cmd_switch(&client, "RESTOREFACTORY").await,
        Commands::Delete { name } => cmd_delete(&client, &name).await,
        Commands::Store { name } => cmd_store(&client, &name).await,
        Commands::Stage { name, bindings } => client.stage_update(&name, &bindings).await,
        Commands::Bind { vb, action, replace } => cmd_bind(&client, vb, &action, replace).await,
        Commands::Unbind { vb } => cmd_unbind(&client, vb).await,
        Commands::Fire { action } => client.fire(&action).await,
        Commands::FindBinding { action } => cmd_find_binding(&client, &action).await,
        Commands::Press { vb } => client.inject_edge(vb, "press").await,
        Commands::Release { vb } => client.inject_edge(vb, "release").await,
        Commands::Tap { vb, hold_ms } => cmd_tap(&client, vb, hold_ms).await,
        Commands::Bindings { vb } => cmd_bindings(&client, vb).await,
        Commands::SetSecret { key, value } => client.set_secret(&key, &value).await,
        Commands::HasSecret { key } => cmd_has_secret(&client, &key).await,
        Commands::RemoveSecret { key } => cmd_remove_secret(&client, &key).await,
        Commands::Ir(IrCmd::List) => cmd_ir_list(&client).await,
        Commands::Ir(IrCmd::Store { name, items }) => cmd_ir_store(&client, &name, &items).await,
        Commands::Ir(IrCmd::Delete { name }) => client.delete_infrared(&name).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_list(client: &VButtonClient) -> Result<()> {
    let slots = client.slots().await?;
    let active = client.active_slot().await.unwrap_or_default();
    if slots.is_empty() {
        println!("No slots stored.");
        return Ok(());
    }
    for (i, name) in slots.iter().enumerate() {
        println!("{}: {}{}", i, name, active_marker(name, &active));
    }
    Ok(())
}

async fn cmd_info(client: &VButtonClient) -> Result<()> {
    let api = client.get_api_version().await?;
    let active = client.active_slot().await?;
    let slots = client.slots().await?;
    let recordings = client.infrared_recordings().await?;
    println!("API version: {}", api);
    println!("Active slot: {}", if active.is_empty() { "(none)" } else { active.as_str() });
    println!("Slots:       {}", slots.len());
    println!("Infrared:    {}", recordings.len());

    let transports = client.transports().await?;
    let (hid, actions) = client.chain_sizes().await?;
    let bound = client.bound_buttons().await?;
    println!("Transports:  {}", if transports.is_empty() { "(none)".to_string() } else { transports.join(", ") });
    println!("Chains:      {} HID, {} general", hid, actions);
    let bound: Vec<String> = bound.iter().map(u32::to_string).collect();
    println!("Bound VBs:   {}", bound.join(" "));
    Ok(())
}

async fn cmd_switch(client: &VButtonClient, token: &str) -> Result<()> {
    let active = client.switch(token).await?;
    println!("Active slot: {}", active);
    Ok(())
}

async fn cmd_delete(client: &VButtonClient, name: &str) -> Result<()> {
    client.delete_slot(name).await?;
    println!("Slot '{}' deleted.", name);
    Ok(())
}

async fn cmd_store(client: &VButtonClient, name: &str) -> Result<()> {
    let number = client.store_slot(name).await?;
    println!("Stored slot {}: {}", number, name);
    Ok(())
}

async fn cmd_bind(client: &VButtonClient, vb: u32, action: &str, replace: bool) -> Result<()> {
    let added = client.bind(vb, action, replace).await?;
    println!("VB {}: {} entries added", vb, added);
    Ok(())
}

async fn cmd_unbind(client: &VButtonClient, vb: u32) -> Result<()> {
    let removed = client.unbind(vb).await?;
    println!("VB {}: {} entries removed", vb, removed);
    Ok(())
}

async fn cmd_find_binding(client: &VButtonClient, action: &str) -> Result<()> {
    let hits = client.find_binding(action).await?;
    if hits.is_empty() {
        println!("Not bound.");
    }
    for (vb, edge) in &hits {
        println!("VB {} {}", vb, edge);
    }
    Ok(())
}

async fn cmd_has_secret(client: &VButtonClient, key: &str) -> Result<()> {
    let set = client.has_secret(key).await?;
    println!("{}: {}", key, if set { "set" } else { "not set" });
    Ok(())
}

async fn cmd_remove_secret(client: &VButtonClient, key: &str) -> Result<()> {
    if !client.remove_secret(key).await? {
        println!("{}: was not set", key);
    }
    Ok(())
}

async fn cmd_ir_store(client: &VButtonClient, name: &str, items: &[u32]) -> Result<()> {
    let number = client.store_infrared(name, items).await?;
    println!("Stored infrared recording {}: {}", number, name);
    Ok(())
}

async fn cmd_tap(client: &VButtonClient, vb: u32, hold_ms: u64) -> Result<()> {
    client.inject_edge(vb, "press").await?;
    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    client.inject_edge(vb, "release").await
}

async fn cmd_bindings(client: &VButtonClient, vb: u32) -> Result<()> {
    let lines = client.bindings(vb).await?;
    if lines.is_empty() {
        println!("VB {}: nothing bound", vb);
        return Ok(());
    }
    println!("VB {}:", vb);
    for line in &lines {
        println!("  {}", line);
    }
    Ok(())
}

async fn cmd_ir_list(client: &VButtonClient) -> Result<()> {
    let recordings = client.infrared_recordings().await?;
    if recordings.is_empty() {
        println!("No infrared recordings stored.");
    }
    for name in &recordings {
        println!("{}", name);
    }
    Ok(())
}

/* `VB=JSON`, split at the first '='. */
fn parse_binding(arg: &str) -> Result<(u32, String)> {
    let (vb, action) = arg.split_once('=').ok_or_else(|| anyhow!("expected VB=ACTION, got '{}'", arg))?;
    let vb = vb.trim().parse().with_context(|| format!("bad button number '{}'", vb))?;
    Ok((vb, action.to_string()))
}

fn parse_item(arg: &str) -> Result<u32> {
    match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).with_context(|| format!("bad hex item '{}'", arg)),
        None => arg.parse().with_context(|| format!("bad item '{}'", arg)),
    }
}

fn active_marker(name: &str, active: &str) -> &'static str {
    if name.eq_ignore_ascii_case(active) {
        " [active]"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tap_with_hold() {
        let cli = Cli::try_parse_from(["vbuttonctl", "--session", "tap", "3", "--hold-ms", "500"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Tap { vb: 3, hold_ms: 500 }));
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["vbuttonctl", "restore-factory"]).unwrap();
        assert!(matches!(cli.command, Commands::RestoreFactory));
        let cli = Cli::try_parse_from(["vbuttonctl", "ir", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::Ir(IrCmd::List)));
        assert!(Cli::try_parse_from(["vbuttonctl", "press", "x"]).is_err());
    }

    #[test]
    fn test_parse_stage_bindings() {
        let cli = Cli::try_parse_from([
            "vbuttonctl",
            "stage",
            "typing",
            r#"4={"kind":"mouse_click","param":"right"}"#,
            "0={\"kind\":\"calibrate\"}",
        ])
        .unwrap();
        let Commands::Stage { name, bindings } = cli.command else {
            panic!("not a stage command");
        };
        assert_eq!(name, "typing");
        assert_eq!(bindings[0], (4, r#"{"kind":"mouse_click","param":"right"}"#.to_string()));
        assert_eq!(bindings[1].0, 0);
        assert!(Cli::try_parse_from(["vbuttonctl", "stage", "typing", "calibrate"]).is_err());
    }

    #[test]
    fn test_parse_bind_and_ir_store() {
        let cli = Cli::try_parse_from(["vbuttonctl", "bind", "9", "{}", "--replace"]).unwrap();
        assert!(matches!(cli.command, Commands::Bind { vb: 9, replace: true, .. }));
        let cli = Cli::try_parse_from(["vbuttonctl", "ir", "store", "tv", "0x80000100", "256"]).unwrap();
        let Commands::Ir(IrCmd::Store { items, .. }) = cli.command else {
            panic!("not an ir store command");
        };
        assert_eq!(items, [0x8000_0100, 256]);
        assert!(Cli::try_parse_from(["vbuttonctl", "ir", "store", "tv"]).is_err());
        assert!(Cli::try_parse_from(["vbuttonctl", "ir", "store", "tv", "0xzz"]).is_err());
    }

    #[test]
    fn test_active_marker() {
        assert_eq!(active_marker("Mouse", "mouse"), " [active]");
        assert_eq!(active_marker("keyboard", "mouse"), "");
    }
}
