//! Operator and user views of the loaded extensions.

use super::loader::Loader;
use crate::registry::Registries;

/// Hook and override lists are split once a line grows past this.
const LINE_WRAP: usize = 380;

impl Loader {
    /// Lines of the `MODULES` reply, newest extension first.
    ///
    /// Operators see versions and flags, followed by the active hook types
    /// and the overridden commands.
    pub fn listing(&self, oper: bool, registries: &Registries) -> Vec<String> {
        if self.records.is_empty() {
            return vec!["No modules loaded".to_string()];
        }

        let mut lines = Vec::with_capacity(self.records.len() + 2);
        for ext in self.records.values().rev() {
            let third_party = ext.options.is_third_party();
            if !oper {
                lines.push(format!(
                    "{} ({}){}",
                    ext.name(),
                    ext.description(),
                    if third_party { " [3RD]" } else { "" }
                ));
                continue;
            }
            let mut flags = String::new();
            if ext.is_pending_unload() {
                flags.push_str("[Unloading] ");
            }
            if ext.is_permanent() {
                flags.push_str("[PERM] ");
            }
            if third_party {
                flags.push_str("[3RD] ");
            }
            lines.push(format!(
                "{} - {} ({}) {}",
                ext.name(),
                ext.version(),
                ext.description(),
                flags
            ));
        }

        if oper {
            push_wrapped(
                "Hooks:",
                registries.hooks.active_types().map(|t| t.to_string()),
                &mut lines,
            );
            push_wrapped(
                "Override:",
                registries.commands.overridden().map(|c| c.name.clone()),
                &mut lines,
            );
        }
        lines
    }
}

fn push_wrapped(label: &str, items: impl Iterator<Item = String>, lines: &mut Vec<String>) {
    let mut buf = String::new();
    for item in items {
        buf.push_str(&item);
        buf.push(' ');
        if buf.len() > LINE_WRAP {
            lines.push(format!("{} {}", label, buf));
            buf.clear();
        }
    }
    lines.push(format!("{} {}", label, buf));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_wrapped_splits_long_lists() {
        let mut lines = Vec::new();
        push_wrapped("Hooks:", (0..200).map(|i| i.to_string()), &mut lines);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.starts_with("Hooks: ")));

        let mut lines = Vec::new();
        push_wrapped("Override:", std::iter::empty(), &mut lines);
        assert_eq!(lines, vec!["Override: ".to_string()]);
    }
}
