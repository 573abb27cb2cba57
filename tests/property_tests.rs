//! Property-Based Tests for aura-deploy
//!
//! These tests verify:
//! - Target names parse case-insensitively, aliases included
//! - Host classification
//! - Principal id selection never lands in the reserved range
//! - Provisioning converges from any prior directory state, and repeats are no-ops
//! - Service descriptor fields follow the target's layout

use aura_deploy::config::DeployConfig;
use aura_deploy::descriptor::ServiceDescriptor;
use aura_deploy::fakes::{DirectoryState, MemoryHost};
use aura_deploy::platform::{
    PlatformTarget, Resolution, classify_host, parse_target, resolve_target,
};
use aura_deploy::provisioner::{
    DATA_DIR_MODE, LOG_DIR_MODE, RESERVED_ID_FLOOR, next_principal_id, provision,
    service_directories,
};
use proptest::prelude::*;

fn target_strategy() -> impl Strategy<Value = PlatformTarget> {
    prop_oneof![
        Just(PlatformTarget::Linux),
        Just(PlatformTarget::Windows),
        Just(PlatformTarget::MacOs),
    ]
}

/// Every accepted spelling with the family it names
fn alias_strategy() -> impl Strategy<Value = (&'static str, PlatformTarget)> {
    prop_oneof![
        Just(("linux", PlatformTarget::Linux)),
        Just(("windows", PlatformTarget::Windows)),
        Just(("win", PlatformTarget::Windows)),
        Just(("macos", PlatformTarget::MacOs)),
        Just(("mac", PlatformTarget::MacOs)),
        Just(("darwin", PlatformTarget::MacOs)),
        Just(("osx", PlatformTarget::MacOs)),
    ]
}

/// Apply a case mask to `word`
fn mix_case(word: &str, mask: &[bool]) -> String {
    word.chars()
        .zip(mask.iter().cycle())
        .map(|(c, &upper)| if upper { c.to_ascii_uppercase() } else { c })
        .collect()
}

// =============================================================================
// Platform Resolution
// =============================================================================

proptest! {
    /// Aliases parse regardless of case and surrounding whitespace
    #[test]
    fn target_aliases_parse_case_insensitively(
        (alias, target) in alias_strategy(),
        mask in prop::collection::vec(any::<bool>(), 1..8),
        pad in 0usize..3,
    ) {
        let name = format!("{}{}{}", " ".repeat(pad), mix_case(alias, &mask), " ".repeat(pad));
        prop_assert_eq!(parse_target(&name).unwrap(), target);
    }

    /// Display → parse is identity
    #[test]
    fn target_display_roundtrip(target in target_strategy()) {
        let s = target.to_string();
        prop_assert_eq!(s.to_lowercase(), s.clone());
        prop_assert_eq!(parse_target(&s).unwrap(), target);
    }

    /// Anything mentioning linux is a Linux host
    #[test]
    fn linux_signals_classify_as_linux(prefix in "[a-z0-9_]{0,8}", suffix in "[a-z0-9_-]{0,8}") {
        let signal = format!("{}linux{}", prefix, suffix);
        prop_assert_eq!(classify_host(&signal), Some(PlatformTarget::Linux));
    }

    /// darwin<version> is macOS
    #[test]
    fn darwin_versions_classify_as_macos(major in 0u32..40, minor in 0u32..10) {
        let signal = format!("darwin{}.{}", major, minor);
        prop_assert_eq!(classify_host(&signal), Some(PlatformTarget::MacOs));
    }

    /// A target runs only on its own family and is skipped elsewhere
    #[test]
    fn resolve_target_runs_only_on_matching_host(
        target in target_strategy(),
        host in target_strategy(),
    ) {
        let resolution = resolve_target(target, &host.to_string());
        if target == host {
            prop_assert_eq!(resolution, Resolution::Target(target));
        } else {
            let is_skip = matches!(
                resolution,
                Resolution::Skip { target: Some(t), .. } if t == target
            );
            prop_assert!(is_skip);
        }
    }
}

// =============================================================================
// Principal Provisioning
// =============================================================================

/// Prior state of one directory: absent, or present with any owner and mode
fn prior_directory_strategy() -> impl Strategy<Value = Option<(Option<&'static str>, u32)>> {
    prop::option::of((
        prop::option::of(prop_oneof![Just("root"), Just("aura"), Just("nobody")]),
        0u32..0o1000,
    ))
}

proptest! {
    /// The next id is above every assigned id and never reserved
    #[test]
    fn next_id_is_above_max_and_floor(max in 0u32..100_000) {
        let id = next_principal_id(max);
        prop_assert!(id >= RESERVED_ID_FLOOR);
        prop_assert!(id > max);
    }

    /// Whatever state the directories were in, one run leaves them owned by
    /// the principal with the required modes, and a second run changes nothing
    #[test]
    fn provisioning_converges_and_is_idempotent(
        ids in prop::collection::vec(0u32..70_000, 0..12),
        existing_id in prop::option::of(500u32..60_000),
        data in prior_directory_strategy(),
        log in prior_directory_strategy(),
    ) {
        let host = MemoryHost::with_assigned_ids(&ids);
        if let Some(id) = existing_id {
            host.add_principal("aura", Some(id));
        }
        let layout = PlatformTarget::Linux.layout("aura");
        for (path, prior) in [(&layout.data_dir, data), (&layout.log_dir, log)] {
            if let Some((owner, mode)) = prior {
                host.add_directory(path, owner, mode);
            }
        }
        let dirs = service_directories(&layout, "aura");

        let first = provision(&host, true, "aura", &layout.data_dir, &dirs).unwrap();
        let expected_data = DirectoryState { owner: Some("aura".to_string()), mode: DATA_DIR_MODE };
        let expected_log = DirectoryState { owner: Some("aura".to_string()), mode: LOG_DIR_MODE };
        prop_assert_eq!(host.directory(&layout.data_dir), Some(expected_data.clone()));
        prop_assert_eq!(host.directory(&layout.log_dir), Some(expected_log.clone()));
        match existing_id {
            Some(id) => prop_assert_eq!(first.id, Some(id)),
            None => prop_assert!(first.id.is_some_and(|id| id >= RESERVED_ID_FLOOR)),
        }

        let creates = host.create_calls();
        let second = provision(&host, true, "aura", &layout.data_dir, &dirs).unwrap();
        prop_assert_eq!(second, first);
        prop_assert_eq!(host.create_calls(), creates);
        prop_assert_eq!(host.principal_count(), 1);
        prop_assert_eq!(host.directory(&layout.data_dir), Some(expected_data));
        prop_assert_eq!(host.directory(&layout.log_dir), Some(expected_log));
    }
}

// =============================================================================
// Service Descriptors
// =============================================================================

proptest! {
    /// Descriptor fields are derived from the target layout and principal
    #[test]
    fn descriptor_fields_follow_layout(
        target in target_strategy(),
        binary in "[a-z][a-z0-9-]{0,15}",
        args in prop::collection::vec("[a-z0-9=-]{1,10}", 0..4),
    ) {
        let config = DeployConfig::default();
        let layout = target.layout(&config.app);
        let descriptor = ServiceDescriptor::for_binary(&config, target, &binary, &args);

        prop_assert_eq!(descriptor.run_as, config.principal_for(target));
        prop_assert_eq!(descriptor.working_dir, layout.data_dir);
        prop_assert_eq!(descriptor.log_dir, layout.log_dir);
        prop_assert_eq!(descriptor.args, args);
        prop_assert!(descriptor.executable.as_str().starts_with(layout.bin_dir.as_str()));
        let expected_file = format!("{}{}", binary, target.exe_suffix());
        prop_assert_eq!(descriptor.executable.file_name(), expected_file.as_str());
        prop_assert!(descriptor.id.ends_with(&binary));
    }
}
