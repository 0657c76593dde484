use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Server actions (POST /servers/{id}/action)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ServerAction {
    #[serde(rename = "cloudlet-handoff")]
    Handoff {
        #[serde(default)]
        handoff_url: Option<String>,
        #[serde(default)]
        dest_token: Option<String>,
        #[serde(default)]
        dest_vmname: Option<String>,
    },
    #[serde(rename = "cloudlet-base")]
    CreateBase { name: String },
    #[serde(rename = "cloudlet-overlay-finish")]
    FinishOverlay {
        #[serde(rename = "overlay-name")]
        overlay_name: String,
    },
}

impl ServerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerAction::Handoff { .. } => "cloudlet-handoff",
            ServerAction::CreateBase { .. } => "cloudlet-base",
            ServerAction::FinishOverlay { .. } => "cloudlet-overlay-finish",
        }
    }
}
