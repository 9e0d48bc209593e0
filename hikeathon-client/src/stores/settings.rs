use std::{collections::BTreeMap, sync::Arc};

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use hikeathon_core::KeyValueStore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{Observable, chat::DEFAULT_SYSTEM_PROMPT};

pub const SETTINGS_KEY: &str = "settings";
pub const DEFAULT_PRESET: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    De,
}

/// A named assistant persona offered in the chat view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptPreset {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub system_prompt: &'static str,
}

pub static GPT_PRESETS: [GptPreset; 8] = [
    GptPreset {
        key: "general",
        name: "General",
        description: "A helpful AI assistant for general questions and tasks",
        system_prompt: DEFAULT_SYSTEM_PROMPT,
    },
    GptPreset {
        key: "coding",
        name: "Coding",
        description: "Expert programming assistance and code debugging",
        system_prompt: "You are an expert programming assistant at HIKEathon 2025. Help with code, debugging, and technical questions. Provide clear explanations and working code examples.",
    },
    GptPreset {
        key: "creative",
        name: "Creative",
        description: "Brainstorming and creative ideation partner",
        system_prompt: "You are a creative assistant helping with brainstorming and ideation at HIKEathon 2025. Be imaginative, encouraging, and help teams think outside the box.",
    },
    GptPreset {
        key: "research",
        name: "Research",
        description: "Information gathering and data analysis assistant",
        system_prompt: "You are a research assistant at HIKEathon 2025. Help teams find information, analyze data, and provide well-sourced answers with citations when possible.",
    },
    GptPreset {
        key: "interview",
        name: "Interview GPT",
        description: "Conduct user interviews and customer discovery",
        system_prompt: "You are an expert interviewer at HIKEathon 2025. Help teams conduct user interviews and customer discovery. Ask insightful follow-up questions, identify key insights, and help teams understand customer pain points and needs.",
    },
    GptPreset {
        key: "bmc",
        name: "BMC Helper",
        description: "Business Model Canvas validation and structuring",
        system_prompt: "You are a Business Model Canvas expert at HIKEathon 2025. Help teams structure and validate their business model by guiding them through each canvas element: Value Propositions, Customer Segments, Revenue Streams, Cost Structure, Key Partners, Key Activities, Key Resources, and Channels.",
    },
    GptPreset {
        key: "reframer",
        name: "Challenge Reframer",
        description: "Problem reframing and synthesis of insights",
        system_prompt: "You are a challenge reframing and problem-solving specialist at HIKEathon 2025. Help teams synthesize insights into actionable problem statements. Guide them to reframe challenges, identify root causes, and develop innovative solutions.",
    },
    GptPreset {
        key: "ideation",
        name: "Ideation Card Giver",
        description: "Creative brainstorming and ideation",
        system_prompt: "You are a creative ideation facilitator at HIKEathon 2025. Generate diverse ideas and creative solutions for team challenges. Use brainstorming techniques, prompt divergent thinking, and help teams explore unconventional approaches to their problems.",
    },
];

pub fn gpt_preset(key: &str) -> Option<&'static GptPreset> {
    GPT_PRESETS.iter().find(|preset| preset.key == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Before,
    During,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: Theme,
    pub language: Language,
    /// Edited prompts keyed by preset; missing keys fall back to the preset.
    pub system_prompts: BTreeMap<String, String>,
    pub current_preset: String,
    /// Local wall-clock times.
    pub event_start: NaiveDateTime,
    pub event_end: NaiveDateTime,
    pub broadcast_message: Option<String>,
    pub broadcast_dismissed: bool,
    pub show_countdown: bool,
    pub auto_save_chat: bool,
    pub sound_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            language: Language::default(),
            system_prompts: BTreeMap::new(),
            current_preset: DEFAULT_PRESET.to_owned(),
            event_start: local_time(2025, 2, 1, 9),
            event_end: local_time(2025, 2, 2, 18),
            broadcast_message: None,
            broadcast_dismissed: false,
            show_countdown: true,
            auto_save_chat: true,
            sound_enabled: true,
        }
    }
}

impl Settings {
    pub fn system_prompt(&self, key: &str) -> Option<&str> {
        self.system_prompts
            .get(key)
            .map(String::as_str)
            .or_else(|| gpt_preset(key).map(|preset| preset.system_prompt))
    }

    pub fn current_system_prompt(&self) -> &str {
        self.system_prompt(&self.current_preset)
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub fn current_gpt(&self) -> &'static GptPreset {
        gpt_preset(&self.current_preset).unwrap_or(&GPT_PRESETS[0])
    }

    pub fn event_phase_at(&self, now: NaiveDateTime) -> EventPhase {
        if now < self.event_start {
            EventPhase::Before
        } else if now > self.event_end {
            EventPhase::After
        } else {
            EventPhase::During
        }
    }

    pub fn event_phase(&self) -> EventPhase {
        self.event_phase_at(Local::now().naive_local())
    }

    pub fn visible_broadcast(&self) -> Option<&str> {
        self.broadcast_message
            .as_deref()
            .filter(|_| !self.broadcast_dismissed)
    }
}

fn local_time(year: i32, month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .zip(NaiveTime::from_hms_opt(hour, 0, 0))
        .map(|(date, time)| date.and_time(time))
        .unwrap_or_default()
}

/// User preferences, saved to the durable tier on every change.
pub struct SettingsStore {
    storage: Arc<dyn KeyValueStore>,
    state: Observable<Settings>,
}

impl SettingsStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        let settings = storage
            .get(SETTINGS_KEY)
            .and_then(|raw| match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    warn!("saved settings unreadable, using defaults: {err}");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            storage,
            state: Observable::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.state.subscribe()
    }

    pub fn set_theme(&self, theme: Theme) {
        self.change(|s| s.theme = theme);
    }

    pub fn set_language(&self, language: Language) {
        self.change(|s| s.language = language);
    }

    pub fn set_system_prompt(&self, key: &str, prompt: &str) {
        self.change(|s| {
            s.system_prompts.insert(key.to_owned(), prompt.to_owned());
        });
    }

    /// Switches preset and returns its prompt for the chat store.
    pub fn select_preset(&self, key: &str) -> Option<String> {
        let mut prompt = None;
        self.change(|s| {
            if let Some(found) = s.system_prompt(key).map(str::to_owned) {
                s.current_preset = key.to_owned();
                prompt = Some(found);
            }
        });
        prompt
    }

    pub fn set_event_window(&self, start: NaiveDateTime, end: NaiveDateTime) {
        self.change(|s| {
            s.event_start = start;
            s.event_end = end.max(start);
        });
    }

    /// A new banner message clears an earlier dismissal.
    pub fn set_broadcast(&self, message: Option<String>) {
        self.change(|s| {
            s.broadcast_message = message;
            s.broadcast_dismissed = false;
        });
    }

    pub fn dismiss_broadcast(&self) {
        self.change(|s| s.broadcast_dismissed = true);
    }

    pub fn set_show_countdown(&self, enabled: bool) {
        self.change(|s| s.show_countdown = enabled);
    }

    pub fn set_auto_save_chat(&self, enabled: bool) {
        self.change(|s| s.auto_save_chat = enabled);
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.change(|s| s.sound_enabled = enabled);
    }

    pub fn reset(&self) {
        self.change(|s| *s = Settings::default());
        info!("settings reset");
    }

    fn change(&self, f: impl FnOnce(&mut Settings)) {
        self.state.update(f);
        match self.state.read(serde_json::to_string) {
            Ok(json) => {
                if let Err(err) = self.storage.set(SETTINGS_KEY, &json) {
                    warn!("failed to save settings: {err}");
                }
            }
            Err(err) => warn!("failed to encode settings: {err}"),
        }
    }
}
