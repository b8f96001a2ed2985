//! Host firewall rules for exposed ports.
//!
//! Every rule created for a process is named `{process}-{PROTOCOL}-{port}`,
//! so teardown removes them all with the `{process}-*` wildcard. Rules live in
//! the `ActiveStore` policy store and do not survive a reboot.

use std::collections::BTreeSet;
use std::sync::Arc;

use hostagent_protocol::Expose;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::shell::{ShellError, ShellRunner};

/// Quote a value as a PowerShell single-quoted string literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Name of the rule for one exposed port.
pub fn rule_name(process_name: &str, expose: &Expose) -> String {
    format!("{process_name}-{expose}")
}

/// Distinct `(protocol, port)` pairs a rule is created for. Port 0 is skipped.
pub fn rule_ports(exposes: &[Expose]) -> BTreeSet<(&'static str, u16)> {
    exposes
        .iter()
        .filter(|e| e.port != 0)
        .map(|e| (e.protocol.as_str(), e.port))
        .collect()
}

/// Command that creates one allow rule per expose, or `None` when there is
/// nothing to create. Port 0 entries are skipped and duplicates collapse.
pub fn create_rules_command(process_name: &str, exposes: &[Expose]) -> Option<String> {
    let unique = rule_ports(exposes);
    if unique.is_empty() {
        return None;
    }

    let commands: Vec<String> = unique
        .into_iter()
        .map(|(protocol, port)| {
            let name = ps_quote(&format!("{process_name}-{protocol}-{port}"));
            format!(
                "New-NetFirewallRule -Name {name} -DisplayName {name} -Action Allow \
                 -Protocol {protocol} -LocalPort {port} -Enabled True \
                 -PolicyStore ActiveStore -ErrorAction Ignore | Out-Null"
            )
        })
        .collect();
    Some(commands.join("; "))
}

/// Command that removes every rule owned by `process_name`.
pub fn remove_rules_command(process_name: &str) -> String {
    format!(
        "Get-NetFirewallRule -PolicyStore ActiveStore -Name {} -ErrorAction Ignore | \
         ForEach-Object {{Remove-NetFirewallRule -Name $_.Name -PolicyStore ActiveStore \
         -ErrorAction Ignore | Out-Null}}",
        ps_quote(&format!("{process_name}-*"))
    )
}

fn is_already_exists(err: &ShellError) -> bool {
    match err {
        ShellError::Failed { stderr, .. } => stderr.to_ascii_lowercase().contains("already exists"),
        _ => false,
    }
}

/// Creates and removes the firewall rules of managed processes.
#[derive(Clone)]
pub struct FirewallManager {
    shell: Arc<dyn ShellRunner>,
}

impl FirewallManager {
    pub fn new(shell: Arc<dyn ShellRunner>) -> Self {
        Self { shell }
    }

    /// Create one allow rule per expose. A no-op for an empty list.
    pub async fn create_rules(
        &self,
        process_name: &str,
        exposes: &[Expose],
        cancel: &CancellationToken,
    ) -> Result<(), ShellError> {
        let Some(command) = create_rules_command(process_name, exposes) else {
            return Ok(());
        };

        match self.shell.execute(&command, cancel).await {
            Ok(_) => {
                info!(
                    "[Firewall] Created {} rule(s) for {process_name}",
                    rule_ports(exposes).len()
                );
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!("[Firewall] Rules for {process_name} already exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove all rules owned by `process_name`. Succeeds when none exist.
    pub async fn remove_rules(
        &self,
        process_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ShellError> {
        self.shell
            .execute(&remove_rules_command(process_name), cancel)
            .await?;
        debug!("[Firewall] Removed rules for {process_name}");
        Ok(())
    }
}
