use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MirrorConfig;
use crate::title::{fold_translation_title, is_syncable_title};

/// One change notification as emitted by the wiki's change hook.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChangeEvent {
    pub title: String,
    #[serde(default)]
    pub namespace: i32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub log_type: Option<String>,
    #[serde(default)]
    pub log_action: Option<String>,
    #[serde(default)]
    pub log_params: Option<LogParams>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct LogParams {
    #[serde(default)]
    pub target: Option<String>,
    /// `"0"` / `"1"` from the hook; numbers and booleans are accepted too.
    #[serde(default)]
    pub noredir: Option<Value>,
}

impl LogParams {
    /// `noredir = 0` means the wiki left a redirect behind at the old title.
    pub fn leaves_redirect(&self) -> bool {
        match &self.noredir {
            Some(Value::String(value)) => value.trim() == "0",
            Some(Value::Number(value)) => value.as_i64() == Some(0),
            Some(Value::Bool(value)) => !value,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upsert {
        title: String,
    },
    Delete {
        title: String,
    },
    Move {
        source: String,
        target: String,
        leave_redirect: bool,
    },
    Ignore {
        reason: String,
    },
}

impl ChangeEvent {
    pub fn edit(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            namespace: 0,
            kind: "edit".to_string(),
            log_type: None,
            log_action: None,
            log_params: None,
        }
    }

    /// Maps the event onto one controller path. Translation snippets are
    /// folded to their parent title before anything else looks at them.
    pub fn classify(&self, config: &MirrorConfig) -> SyncAction {
        let excluded = &config.filters.excluded_prefixes;
        if !is_syncable_title(&self.title, self.namespace, excluded) {
            return SyncAction::Ignore {
                reason: format!(
                    "non-content title `{}` (namespace {})",
                    self.title, self.namespace
                ),
            };
        }
        let title = fold_translation_title(self.title.trim(), &config.translations.langs);

        match self.kind.as_str() {
            "new" | "edit" => return SyncAction::Upsert { title },
            "log" => {}
            other => {
                return SyncAction::Ignore {
                    reason: format!("unrecognized event type `{other}`"),
                };
            }
        }

        let log_type = self.log_type.as_deref().unwrap_or_default();
        let log_action = self.log_action.as_deref().unwrap_or_default();
        match (log_type, log_action) {
            ("delete", "delete") => SyncAction::Delete { title },
            ("delete", "restore" | "delete_redir") => SyncAction::Upsert { title },
            ("move", "move" | "move_redir") => {
                let params = self.log_params.clone().unwrap_or_default();
                let Some(target) = params
                    .target
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                else {
                    return SyncAction::Ignore {
                        reason: format!("move of `{title}` without a target"),
                    };
                };
                if !is_syncable_title(target, 0, excluded) {
                    return SyncAction::Ignore {
                        reason: format!("move target `{target}` is not a content title"),
                    };
                }
                SyncAction::Move {
                    source: title,
                    target: fold_translation_title(target, &config.translations.langs),
                    leave_redirect: params.leaves_redirect(),
                }
            }
            _ => SyncAction::Ignore {
                reason: format!("unrecognized log event `{log_type}/{log_action}`"),
            },
        }
    }
}
