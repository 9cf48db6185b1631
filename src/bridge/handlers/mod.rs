mod app;
mod data;
mod jail;
mod keys;
mod messaging;
mod sessions;
mod settings;
mod syftbox;

use serde_json::{json, Value};

use crate::error::CoreResult;

use super::registry::{Category, CommandContext, CommandRegistry};

// --- reflection (always reachable, never blocklisted) ---

async fn discover(ctx: CommandContext) -> CoreResult<Value> {
    Ok(json!({
        "name": "biovault",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "BioVault collaboration core agent bridge",
        "transports": ["ws", "http"],
        "categories": Category::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "command_count": ctx.registry.len(),
    }))
}

async fn list_commands(ctx: CommandContext) -> CoreResult<Value> {
    Ok(ctx.registry.command_list(&ctx.core.settings.load()))
}

async fn get_schema(ctx: CommandContext) -> CoreResult<Value> {
    Ok(ctx.registry.schema(&ctx.core.settings.load()))
}

async fn events_info(ctx: CommandContext) -> CoreResult<Value> {
    Ok(json!({
        "event_types": ["progress", "log", "status"],
        "streaming_commands": ctx.registry.streaming_names(),
    }))
}

/// The full static command table. Every category of the bridge surface
/// has at least one entry; names are stable wire contract.
pub fn build_registry() -> CommandRegistry {
    let mut r = CommandRegistry::default();

    // agent_api: reflection, under both canonical and short names.
    r.add("agent_api_discover", Category::AgentApi, discover).read_only();
    r.add("agent_api_list_commands", Category::AgentApi, list_commands).read_only();
    r.add("agent_api_get_schema", Category::AgentApi, get_schema).read_only();
    r.add("agent_api_events_info", Category::AgentApi, events_info).read_only();
    r.add("discover", Category::AgentApi, discover).read_only();
    r.add("list_commands", Category::AgentApi, list_commands).read_only();
    r.add("get_schema", Category::AgentApi, get_schema).read_only();
    r.add("events_info", Category::AgentApi, events_info).read_only();

    // app_status
    r.add("get_app_version", Category::AppStatus, app::get_app_version).read_only();
    r.add("get_app_status", Category::AppStatus, app::get_app_status).read_only();
    r.add("get_system_info", Category::AppStatus, app::get_system_info).read_only();

    // onboarding
    r.add("get_onboarding_status", Category::Onboarding, app::get_onboarding_status).read_only();
    r.add("complete_onboarding", Category::Onboarding, app::complete_onboarding);

    // profiles
    r.add("list_profiles", Category::Profiles, settings::list_profiles).read_only();
    r.add("get_active_profile", Category::Profiles, settings::get_active_profile).read_only();
    r.add("create_profile", Category::Profiles, settings::create_profile);
    r.add("switch_profile", Category::Profiles, settings::switch_profile);
    r.add("delete_profile", Category::Profiles, settings::delete_profile).dangerous();

    // settings
    r.add("get_settings", Category::Settings, settings::get_settings).read_only();
    r.add("update_settings", Category::Settings, settings::update_settings);
    r.add("get_setting", Category::Settings, settings::get_setting).read_only();
    r.add("set_setting", Category::Settings, settings::set_setting);
    r.add("get_ai_config", Category::Settings, app::get_ai_config).read_only();
    r.add("update_ai_config", Category::Settings, app::update_ai_config);

    // ui_control
    r.add("open_path", Category::UiControl, app::open_path);

    // dependencies
    r.add("check_dependencies", Category::Dependencies, app::check_dependencies).read_only();
    r.add("install_dependency", Category::Dependencies, app::install_dependency)
        .streams_events()
        .long_timeout();

    // syftbox
    r.add("start_syftbox_client", Category::Syftbox, syftbox::start_syftbox_client).long_timeout();
    r.add("stop_syftbox_client", Category::Syftbox, syftbox::stop_syftbox_client);
    r.add("restart_syftbox_client", Category::Syftbox, syftbox::restart_syftbox_client).long_timeout();
    r.add("get_syftbox_state", Category::Syftbox, syftbox::get_syftbox_state).read_only();
    r.add("trigger_syftbox_sync", Category::Syftbox, syftbox::trigger_syftbox_sync);
    r.add("syftbox_queue_status", Category::Syftbox, syftbox::syftbox_queue_status).read_only();
    r.add("get_syftbox_config_info", Category::Syftbox, syftbox::get_syftbox_config_info).read_only();
    r.add("syftbox_request_otp", Category::Syftbox, syftbox::syftbox_request_otp);
    r.add("syftbox_submit_otp", Category::Syftbox, syftbox::syftbox_submit_otp);

    // keys
    r.add("publish_identity", Category::Keys, keys::publish_identity);
    r.add("get_public_identity", Category::Keys, keys::get_public_identity).read_only();
    r.add("export_identity_bundle", Category::Keys, keys::export_identity_bundle).read_only();
    r.add("import_contact_bundle", Category::Keys, keys::import_contact_bundle);

    // participants
    r.add("list_contacts", Category::Participants, keys::list_contacts).read_only();
    r.add("trust_participant", Category::Participants, keys::trust_participant);
    r.add("get_participant_bundle", Category::Participants, keys::get_participant_bundle).read_only();

    // messaging
    r.add("send_message", Category::Messaging, messaging::send_message);
    r.add("list_message_threads", Category::Messaging, messaging::list_message_threads).read_only();
    r.add("get_thread_messages", Category::Messaging, messaging::get_thread_messages).read_only();
    r.add("refresh_messages_batched", Category::Messaging, messaging::refresh_messages_batched)
        .long_timeout();
    r.add("sync_messages_with_failures", Category::Messaging, messaging::sync_messages_with_failures)
        .long_timeout();
    r.add("mark_thread_as_read", Category::Messaging, messaging::mark_thread_as_read);
    r.add("delete_message", Category::Messaging, messaging::delete_message);
    r.add("delete_thread", Category::Messaging, messaging::delete_thread);
    r.add("list_spaces", Category::Messaging, messaging::list_spaces).read_only();
    r.add("create_space", Category::Messaging, messaging::create_space);

    // files
    r.add("list_directory", Category::Files, data::list_directory).read_only();
    r.add("get_file_info", Category::Files, data::get_file_info).read_only();

    // network
    r.add("check_network_status", Category::Network, app::check_network_status).read_only();

    // projects
    r.add("list_projects", Category::Projects, data::list_projects).read_only();
    r.add("create_project", Category::Projects, data::create_project);

    // pipelines
    r.add("list_pipelines", Category::Pipelines, data::list_pipelines).read_only();

    // datasets
    r.add("list_datasets", Category::Datasets, data::list_datasets).read_only();
    r.add("get_dataset", Category::Datasets, data::get_dataset).read_only();

    // runs
    r.add("list_runs", Category::Runs, data::list_runs).read_only();

    // sessions
    r.add("create_session", Category::Sessions, sessions::create_session);
    r.add("list_sessions", Category::Sessions, sessions::list_sessions).read_only();
    r.add("get_session", Category::Sessions, sessions::get_session).read_only();
    r.add("close_session", Category::Sessions, sessions::close_session);
    r.add("list_session_invitations", Category::Sessions, sessions::list_session_invitations)
        .read_only();
    r.add("accept_session_invitation", Category::Sessions, sessions::accept_session_invitation);
    r.add("reject_session_invitation", Category::Sessions, sessions::reject_session_invitation);
    r.add("list_session_datasets", Category::Sessions, sessions::list_session_datasets).read_only();
    r.add("add_dataset_to_session", Category::Sessions, sessions::add_dataset_to_session);
    r.add("remove_dataset_from_session", Category::Sessions, sessions::remove_dataset_from_session);
    r.add("add_files_to_session", Category::Sessions, sessions::add_files_to_session);
    r.add("open_session_folder", Category::Sessions, sessions::open_session_folder);

    // jupyter
    r.add("launch_session_jupyter", Category::Jupyter, sessions::launch_session_jupyter)
        .streams_events()
        .long_timeout();
    r.add("stop_session_jupyter", Category::Jupyter, sessions::stop_session_jupyter);
    r.add("reset_session_jupyter", Category::Jupyter, sessions::reset_session_jupyter);
    r.add("get_session_jupyter_status", Category::Jupyter, sessions::get_session_jupyter_status)
        .read_only();

    // logs
    r.add("get_audit_log", Category::Logs, app::get_audit_log).read_only();
    r.add("clear_audit_log", Category::Logs, app::clear_audit_log);
    r.add("get_desktop_log", Category::Logs, app::get_desktop_log).read_only();

    // sql
    r.add("sql_query", Category::Sql, data::sql_query).read_only().dangerous();
    r.add("sql_execute", Category::Sql, data::sql_execute).dangerous();

    // reset
    r.add("reset_everything", Category::Reset, data::reset_everything).streams_events();
    r.add("reset_syftbox", Category::Reset, data::reset_syftbox);

    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn every_category_has_a_command() {
        let registry = build_registry();
        let covered: BTreeSet<&str> = registry
            .names()
            .map(|name| registry.get(name).unwrap().category.as_str())
            .collect();
        for category in Category::ALL {
            assert!(
                covered.contains(category.as_str()),
                "category {} has no commands",
                category.as_str()
            );
        }
    }

    #[test]
    fn reset_commands_are_flagged_dangerous() {
        let registry = build_registry();
        for name in ["reset_everything", "reset_syftbox"] {
            assert!(registry.get(name).unwrap().dangerous, "{name} must be dangerous");
        }
    }

    #[test]
    fn streaming_commands_are_declared() {
        let registry = build_registry();
        let streaming = registry.streaming_names();
        assert!(streaming.contains(&"install_dependency"));
        assert!(streaming.contains(&"launch_session_jupyter"));
        assert!(!streaming.contains(&"get_app_version"));
    }

    #[test]
    fn long_running_commands_get_the_long_budget() {
        let registry = build_registry();
        for name in ["install_dependency", "launch_session_jupyter", "refresh_messages_batched"] {
            assert_eq!(
                registry.get(name).unwrap().timeout,
                crate::bridge::registry::LONG_TIMEOUT,
                "{name} should have the long budget"
            );
        }
        assert_eq!(
            registry.get("get_app_version").unwrap().timeout,
            crate::bridge::registry::DEFAULT_TIMEOUT
        );
    }

    #[test]
    fn reflection_names_are_registered() {
        let registry = build_registry();
        for name in [
            "discover",
            "list_commands",
            "get_schema",
            "events_info",
            "agent_api_discover",
            "agent_api_list_commands",
            "agent_api_get_schema",
            "agent_api_events_info",
        ] {
            assert!(registry.get(name).is_some(), "{name} missing");
            assert!(crate::bridge::registry::is_reflection(name));
        }
    }
}
