//! Input injection commands (`input tap`, `input text`, ...)

use serde::{Deserialize, Serialize};

use fleet_core::prelude::*;

/// A synthetic input event for a device screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InputAction {
    Tap {
        x: u32,
        y: u32,
    },
    Swipe {
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        #[serde(default)]
        duration_ms: Option<u32>,
    },
    Text {
        text: String,
    },
    /// Android key code, e.g. `KEYCODE_ENTER` or `66`
    Key {
        code: String,
    },
    Back,
    Home,
}

impl InputAction {
    /// Render as a device shell command line (`input ...`)
    pub fn to_shell(&self) -> Result<String> {
        let command = match self {
            InputAction::Tap { x, y } => format!("input tap {} {}", x, y),
            InputAction::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => match duration_ms {
                Some(ms) => format!("input swipe {} {} {} {} {}", x1, y1, x2, y2, ms),
                None => format!("input swipe {} {} {} {}", x1, y1, x2, y2),
            },
            InputAction::Text { text } => {
                if text.is_empty() {
                    return Err(Error::policy("input text is empty"));
                }
                format!("input text {}", escape_text(text)?)
            }
            InputAction::Key { code } => {
                if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(Error::policy(format!("invalid key code: {:?}", code)));
                }
                format!("input keyevent {}", code)
            }
            InputAction::Back => "input keyevent KEYCODE_BACK".to_string(),
            InputAction::Home => "input keyevent KEYCODE_HOME".to_string(),
        };
        Ok(command)
    }
}

/// `input text` treats `%s` as a space and runs through the device shell
fn escape_text(text: &str) -> Result<String> {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' ' => escaped.push_str("%s"),
            '\n' | '\r' => return Err(Error::policy("input text may not contain newlines")),
            '\'' | '"' | '\\' | '`' | '$' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '?'
            | '~' | '#' | '!' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    Ok(escaped)
}
