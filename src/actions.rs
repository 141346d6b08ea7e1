use std::collections::BTreeMap;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::ButtonsConfig;
use crate::mapper::ButtonEvent;

/// The externally-supplied mapping from canonical button codes to executable
/// actions. A code without an entry is a no-op, not an error.
pub struct ActionMap {
    actions: BTreeMap<u8, String>,
    link_ended_action: Option<String>,
    log_button_presses: bool,
}

impl ActionMap {
    pub fn from_config(config: &ButtonsConfig) -> Self {
        let mut actions = BTreeMap::new();

        for (key, program) in &config.actions {
            match parse_code(key) {
                Some(code) => {
                    actions.insert(code, program.clone());
                },
                None => warn!("Ignoring action with unparseable button code {:?}", key),
            }
        }

        info!("Configured {} button action(s)", actions.len());
        for (code, program) in &actions {
            debug!("0x{:02x} -> {}", code, program);
        }

        ActionMap {
            actions,
            link_ended_action: config.link_ended_action.clone(),
            log_button_presses: config.log_button_presses,
        }
    }

    pub fn dispatch(&self, event: &ButtonEvent) {
        if self.log_button_presses {
            info!("Button press: {} (code 0x{:02x})", event.name, event.code);
        }

        match self.actions.get(&event.code) {
            Some(program) => spawn_detached(program),
            None => debug!("No action configured for button 0x{:02x}", event.code),
        }
    }

    pub fn dispatch_link_ended(&self) {
        if let Some(program) = &self.link_ended_action {
            info!("Link ended, running {}", program);
            spawn_detached(program);
        }
    }
}

fn spawn_detached(program: &str) {
    match Command::new(program)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_child) => debug!("Launched {}", program),
        Err(err) => warn!("Failed to launch {}: {}", program, err),
    }
}

/// Accepts the "0x01" hex form the action file uses.
fn parse_code(key: &str) -> Option<u8> {
    let hex = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X"))?;
    u8::from_str_radix(hex, 16).ok()
}
