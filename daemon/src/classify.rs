/// App classification: which language and category a heartbeat for a given
/// executable should carry, and how a focused window maps onto heartbeat
/// fields.
use crate::heartbeat::EntityType;
use crate::platform::ActiveWindow;
use crate::registry::EnrolledProgram;

pub const FALLBACK_LANGUAGE: &str = "Other";
pub const DEFAULT_CATEGORY: &str = "coding";

/// Language label and category for a known application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppProfile {
    pub language: &'static str,
    pub category: &'static str,
}

/// Lowercase substring of the executable basename → profile. First match
/// wins, so more specific needles come first ("xcode" before "code").
const APP_TABLE: &[(&str, AppProfile)] = &[
    ("xcode", AppProfile { language: "Swift", category: "coding" }),
    ("android studio", AppProfile { language: "Kotlin", category: "coding" }),
    ("studio64", AppProfile { language: "Kotlin", category: "coding" }),
    ("pycharm", AppProfile { language: "Python", category: "coding" }),
    ("rustrover", AppProfile { language: "Rust", category: "coding" }),
    ("goland", AppProfile { language: "Go", category: "coding" }),
    ("webstorm", AppProfile { language: "JavaScript", category: "coding" }),
    ("phpstorm", AppProfile { language: "PHP", category: "coding" }),
    ("rider", AppProfile { language: "C#", category: "coding" }),
    ("clion", AppProfile { language: "C++", category: "coding" }),
    ("idea", AppProfile { language: "Java", category: "coding" }),
    ("unity", AppProfile { language: "C#", category: "coding" }),
    ("godot", AppProfile { language: "GDScript", category: "coding" }),
    ("figma", AppProfile { language: "Figma Design", category: "designing" }),
    ("photoshop", AppProfile { language: "Photoshop", category: "designing" }),
    ("illustrator", AppProfile { language: "Illustrator", category: "designing" }),
    ("blender", AppProfile { language: "Blender", category: "designing" }),
    ("postman", AppProfile { language: "HTTP", category: "debugging" }),
    ("slack", AppProfile { language: FALLBACK_LANGUAGE, category: "communicating" }),
    ("zoom", AppProfile { language: FALLBACK_LANGUAGE, category: "meeting" }),
    ("teams", AppProfile { language: FALLBACK_LANGUAGE, category: "meeting" }),
];

/// Best-effort profile for an executable basename. Case-insensitive substring
/// match against [`APP_TABLE`].
pub fn app_profile(executable_name: &str) -> AppProfile {
    let needle = executable_name.to_lowercase();
    APP_TABLE
        .iter()
        .find(|(known, _)| needle.contains(known))
        .map(|(_, profile)| *profile)
        .unwrap_or(AppProfile {
            language: FALLBACK_LANGUAGE,
            category: DEFAULT_CATEGORY,
        })
}

/// Heartbeat fields derived from a focused window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub project: String,
    pub entity: String,
    pub entity_type: EntityType,
    pub category: String,
    pub language: String,
}

/// Decides what a focused window of an enrolled program is worth reporting.
/// Returning `None` means the window produces no heartbeat.
pub trait WindowClassifier: Send + Sync {
    fn classify(&self, window: &ActiveWindow, program: &EnrolledProgram) -> Option<Classification>;
}

/// Default classifier: the enrolled program is the project and the entity, the
/// app table supplies language and category.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppClassifier;

impl WindowClassifier for AppClassifier {
    fn classify(&self, window: &ActiveWindow, program: &EnrolledProgram) -> Option<Classification> {
        if program.name.trim().is_empty() {
            return None;
        }
        let entity = window
            .executable_path
            .as_deref()
            .unwrap_or(program.path.as_path())
            .to_string_lossy()
            .into_owned();
        let profile = app_profile(&program.name);

        Some(Classification {
            project: program.name.clone(),
            entity,
            entity_type: EntityType::App,
            category: profile.category.to_string(),
            language: profile.language.to_string(),
        })
    }
}
