//! Built-in passes, registered from the job configuration.
//!
//! - **renamer**: whole-program class renaming
//! - **line_numbers**: strips debug line and variable information
//! - **hide_members**: marks members synthetic so decompilers hide them
//! - **shuffle_members**: randomizes field and method order

pub mod hide_members;
pub mod line_numbers;
pub mod renamer;
pub mod shuffle_members;

pub use hide_members::HideMembers;
pub use line_numbers::LineNumberRemover;
pub use renamer::ClassRenamer;
pub use shuffle_members::ShuffleMembers;

use crate::config::JobConfig;
use crate::pass::PassRegistry;

/// Registry for `config`, in the fixed built-in order.
pub fn build_registry(config: &JobConfig) -> PassRegistry {
    let passes = &config.passes;
    let mut registry = PassRegistry::new();
    if passes.rename_classes {
        registry = registry.with_whole_program(ClassRenamer::new(passes.rename_package.clone()));
    }
    if passes.hide_members {
        registry = registry.with_class_pass(HideMembers);
    }
    if passes.remove_line_numbers {
        registry = registry.with_class_pass(LineNumberRemover);
    }
    if passes.shuffle_members {
        registry = registry.with_class_pass(ShuffleMembers::new(config.seed));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_registers_class_passes_only() {
        let registry = build_registry(&JobConfig::default());
        assert_eq!(registry.names(), vec!["hide-members", "line-number-remover", "shuffle-members"]);
    }

    #[test]
    fn renaming_runs_first() {
        let mut config = JobConfig::default();
        config.passes.rename_classes = true;
        config.passes.shuffle_members = false;
        let registry = build_registry(&config);
        assert_eq!(registry.names(), vec!["class-renamer", "hide-members", "line-number-remover"]);
    }
}
