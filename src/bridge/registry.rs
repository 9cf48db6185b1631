use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::CoreServices;
use crate::error::{CoreError, CoreResult};
use crate::settings::Settings;
use crate::supervisor::ControlHandle;

use super::events::EventSink;

/// Everything a handler gets: the service container, normalized args, the
/// per-request event sink, the supervisor control channel, and the
/// registry itself (for the reflection commands).
pub struct CommandContext {
    pub core: Arc<CoreServices>,
    pub registry: Arc<CommandRegistry>,
    pub args: serde_json::Map<String, Value>,
    pub sink: EventSink,
    pub control: ControlHandle,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = CoreResult<Value>> + Send>>;
type Handler = Arc<dyn Fn(CommandContext) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    AgentApi,
    AppStatus,
    Onboarding,
    Profiles,
    Settings,
    UiControl,
    Dependencies,
    Syftbox,
    Keys,
    Messaging,
    Files,
    Participants,
    Network,
    Projects,
    Pipelines,
    Datasets,
    Runs,
    Sessions,
    Jupyter,
    Logs,
    Sql,
    Reset,
}

impl Category {
    pub const ALL: [Category; 22] = [
        Category::AgentApi,
        Category::AppStatus,
        Category::Onboarding,
        Category::Profiles,
        Category::Settings,
        Category::UiControl,
        Category::Dependencies,
        Category::Syftbox,
        Category::Keys,
        Category::Messaging,
        Category::Files,
        Category::Participants,
        Category::Network,
        Category::Projects,
        Category::Pipelines,
        Category::Datasets,
        Category::Runs,
        Category::Sessions,
        Category::Jupyter,
        Category::Logs,
        Category::Sql,
        Category::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::AgentApi => "agent_api",
            Category::AppStatus => "app_status",
            Category::Onboarding => "onboarding",
            Category::Profiles => "profiles",
            Category::Settings => "settings",
            Category::UiControl => "ui_control",
            Category::Dependencies => "dependencies",
            Category::Syftbox => "syftbox",
            Category::Keys => "keys",
            Category::Messaging => "messaging",
            Category::Files => "files",
            Category::Participants => "participants",
            Category::Network => "network",
            Category::Projects => "projects",
            Category::Pipelines => "pipelines",
            Category::Datasets => "datasets",
            Category::Runs => "runs",
            Category::Sessions => "sessions",
            Category::Jupyter => "jupyter",
            Category::Logs => "logs",
            Category::Sql => "sql",
            Category::Reset => "reset",
        }
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for long-running commands (sync, installs, launches).
pub const LONG_TIMEOUT: Duration = Duration::from_secs(180);

/// One registry row: command metadata plus its handler.
pub struct CommandSpec {
    pub name: &'static str,
    pub category: Category,
    pub read_only: bool,
    pub streams_events: bool,
    pub dangerous: bool,
    pub timeout: Duration,
    handler: Handler,
}

impl CommandSpec {
    pub fn read_only(&mut self) -> &mut Self {
        self.read_only = true;
        self
    }

    pub fn streams_events(&mut self) -> &mut Self {
        self.streams_events = true;
        self
    }

    pub fn dangerous(&mut self) -> &mut Self {
        self.dangerous = true;
        self
    }

    pub fn long_timeout(&mut self) -> &mut Self {
        self.timeout = LONG_TIMEOUT;
        self
    }

    pub fn invoke(&self, ctx: CommandContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

/// Reflection commands stay reachable regardless of the blocklist so an
/// agent can always ask what it is allowed to do.
const REFLECTION_COMMANDS: [&str; 8] = [
    "discover",
    "list_commands",
    "get_schema",
    "events_info",
    "agent_api_discover",
    "agent_api_list_commands",
    "agent_api_get_schema",
    "agent_api_events_info",
];

pub fn is_reflection(name: &str) -> bool {
    REFLECTION_COMMANDS.contains(&name)
}

/// Static command table. Built once at bridge startup; never mutated
/// afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    pub fn add<F, Fut>(&mut self, name: &'static str, category: Category, f: F) -> &mut CommandSpec
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(f(ctx)) as HandlerFuture);
        let spec = CommandSpec {
            name,
            category,
            read_only: false,
            streams_events: false,
            dangerous: name.starts_with("reset_"),
            timeout: DEFAULT_TIMEOUT,
            handler,
        };
        debug_assert!(
            !self.commands.contains_key(name),
            "duplicate command registration: {name}"
        );
        self.commands.insert(name, spec);
        self.commands.get_mut(name).expect("just inserted")
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    /// Allowed iff not blocklisted; reflection commands always pass.
    pub fn check_policy(&self, spec: &CommandSpec, settings: &Settings) -> CoreResult<()> {
        if is_reflection(spec.name) {
            return Ok(());
        }
        if settings.agent_bridge_blocklist.contains(spec.name) {
            return Err(CoreError::Blocked);
        }
        Ok(())
    }

    fn is_allowed(&self, spec: &CommandSpec, settings: &Settings) -> bool {
        self.check_policy(spec, settings).is_ok()
    }

    /// Lightweight command list (`GET /commands`, `agent_api_list_commands`).
    pub fn command_list(&self, settings: &Settings) -> Value {
        let commands: Vec<Value> = self
            .commands
            .values()
            .map(|spec| {
                serde_json::json!({
                    "name": spec.name,
                    "category": spec.category.as_str(),
                    "allowed": self.is_allowed(spec, settings),
                })
            })
            .collect();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "commands": commands,
        })
    }

    /// Full schema (`GET /schema`, `agent_api_get_schema`).
    pub fn schema(&self, settings: &Settings) -> Value {
        let commands: Vec<Value> = self
            .commands
            .values()
            .map(|spec| {
                serde_json::json!({
                    "name": spec.name,
                    "category": spec.category.as_str(),
                    "read_only": spec.read_only,
                    "streams_events": spec.streams_events,
                    "dangerous": spec.dangerous,
                    "timeout_secs": spec.timeout.as_secs(),
                    "allowed": self.is_allowed(spec, settings),
                })
            })
            .collect();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "categories": Category::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "commands": commands,
        })
    }

    pub fn streaming_names(&self) -> Vec<&'static str> {
        self.commands
            .values()
            .filter(|spec| spec.streams_events)
            .map(|spec| spec.name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(names: &[&'static str]) -> CommandRegistry {
        let mut registry = CommandRegistry::default();
        for name in names {
            registry.add(name, Category::AppStatus, |_ctx| async { Ok(Value::Null) });
        }
        registry
    }

    fn settings_blocking(names: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.agent_bridge_blocklist = names.iter().map(|s| s.to_string()).collect();
        settings
    }

    #[test]
    fn defaults_and_builder_flags() {
        let mut registry = CommandRegistry::default();
        registry
            .add("install_dependency", Category::Dependencies, |_ctx| async {
                Ok(Value::Null)
            })
            .streams_events()
            .long_timeout();

        let spec = registry.get("install_dependency").unwrap();
        assert!(spec.streams_events);
        assert!(!spec.read_only);
        assert!(!spec.dangerous);
        assert_eq!(spec.timeout, LONG_TIMEOUT);
    }

    #[test]
    fn reset_commands_are_dangerous_by_name() {
        let registry = registry_with(&["reset_everything"]);
        assert!(registry.get("reset_everything").unwrap().dangerous);
    }

    #[test]
    fn blocklist_blocks_non_reflection() {
        let registry = registry_with(&["send_message", "agent_api_list_commands"]);
        let settings = settings_blocking(&["send_message", "agent_api_list_commands"]);

        let blocked = registry.get("send_message").unwrap();
        assert!(matches!(
            registry.check_policy(blocked, &settings),
            Err(CoreError::Blocked)
        ));

        // Reflection survives even a blocklist that names it.
        let reflection = registry.get("agent_api_list_commands").unwrap();
        assert!(registry.check_policy(reflection, &settings).is_ok());
    }

    #[test]
    fn empty_blocklist_allows_everything() {
        let registry = registry_with(&["a_cmd", "b_cmd"]);
        let settings = Settings::default();
        for name in ["a_cmd", "b_cmd"] {
            assert!(registry.check_policy(registry.get(name).unwrap(), &settings).is_ok());
        }
    }

    #[test]
    fn command_list_marks_blocked_commands() {
        let registry = registry_with(&["send_message", "get_app_version"]);
        let settings = settings_blocking(&["send_message"]);
        let list = registry.command_list(&settings);

        let commands = list["commands"].as_array().unwrap();
        let find = |name: &str| {
            commands
                .iter()
                .find(|c| c["name"] == name)
                .unwrap_or_else(|| panic!("{name} missing"))
        };
        assert_eq!(find("send_message")["allowed"], false);
        assert_eq!(find("get_app_version")["allowed"], true);
        assert!(list["version"].is_string());
    }

    #[test]
    fn schema_lists_all_categories() {
        let registry = registry_with(&["x"]);
        let schema = registry.schema(&Settings::default());
        assert_eq!(schema["categories"].as_array().unwrap().len(), 22);
    }
}
