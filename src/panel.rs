//! Status panel rendering.
//!
//! Both backends (and the manager, when nothing is active) paint the same
//! panel: dark background, accent border, title, status line, a truncated
//! message line, and a pulsing indicator while recording or speaking.

use chrono::Utc;

use crate::status::{StatusReport, VoiceState};
use crate::surface::{DrawSurface, PanelRect, Rgb};

const PANEL_BG: Rgb = Rgb(30, 30, 40);
const PANEL_BORDER: Rgb = Rgb(50, 50, 150);
const TITLE_COLOR: Rgb = Rgb(150, 150, 255);
const TEXT_COLOR: Rgb = Rgb(200, 200, 200);

/// Longest message rendered before truncation with an ellipsis.
const MESSAGE_MAX_CHARS: usize = 30;

/// Draw the voice status panel onto the given surface region.
pub fn draw_panel(
    surface: &mut dyn DrawSurface,
    rect: PanelRect,
    title: &str,
    report: &StatusReport,
    caption: Option<&str>,
) {
    surface.fill_rect(rect, PANEL_BG);
    surface.stroke_rect(rect, PANEL_BORDER, 2);

    let x = rect.x;
    let y = rect.y;
    surface.text(x + 10, y + 10, 32, TITLE_COLOR, title);
    surface.text(
        x + 10,
        y + 50,
        24,
        TEXT_COLOR,
        &format!("Status: {}", report.state.as_str()),
    );
    surface.text(x + 10, y + 80, 24, TEXT_COLOR, &truncate(&report.message));

    if let Some(caption) = caption {
        if !caption.is_empty() {
            surface.text(x + 10, y + 140, 24, TEXT_COLOR, &truncate(caption));
        }
    }

    match report.state {
        VoiceState::Listening | VoiceState::Speaking => {
            let pulse = pulse_level();
            let color = Rgb(255, pulse, pulse);
            surface.circle(x + 20, y + 120, 8, color);
            let label = if report.state == VoiceState::Listening {
                "Recording"
            } else {
                "Speaking"
            };
            surface.text(x + 35, y + 112, 24, color, label);
        }
        _ => {}
    }
}

fn truncate(message: &str) -> String {
    if message.chars().count() > MESSAGE_MAX_CHARS {
        let head: String = message.chars().take(MESSAGE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        message.to_string()
    }
}

/// Pulse brightness in 128..=255, cycling once per second of wall time.
fn pulse_level() -> u8 {
    let millis = Utc::now().timestamp_subsec_millis() as u32;
    (128 + (127 * millis / 1000)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusReport;

    #[derive(Default)]
    struct RecordingSurface {
        texts: Vec<String>,
        circles: usize,
        rects: usize,
    }

    impl DrawSurface for RecordingSurface {
        fn fill_rect(&mut self, _rect: PanelRect, _color: Rgb) {
            self.rects += 1;
        }
        fn stroke_rect(&mut self, _rect: PanelRect, _color: Rgb, _width: u32) {
            self.rects += 1;
        }
        fn circle(&mut self, _cx: i32, _cy: i32, _radius: u32, _color: Rgb) {
            self.circles += 1;
        }
        fn text(&mut self, _x: i32, _y: i32, _size: u32, _color: Rgb, text: &str) {
            self.texts.push(text.to_string());
        }
    }

    #[test]
    fn idle_panel_has_no_pulse_indicator() {
        let mut surface = RecordingSurface::default();
        let report = StatusReport::new(VoiceState::Ready, "Press the button to speak");
        draw_panel(
            &mut surface,
            PanelRect::new(0, 0, 250, 200),
            "Voice AI",
            &report,
            None,
        );
        assert_eq!(surface.circles, 0);
        assert!(surface.texts.iter().any(|t| t == "Status: Ready"));
    }

    #[test]
    fn listening_panel_draws_pulse() {
        let mut surface = RecordingSurface::default();
        let report = StatusReport::new(VoiceState::Listening, "Recording...");
        draw_panel(
            &mut surface,
            PanelRect::new(0, 0, 250, 200),
            "Voice AI",
            &report,
            None,
        );
        assert_eq!(surface.circles, 1);
        assert!(surface.texts.iter().any(|t| t == "Recording"));
    }

    #[test]
    fn long_messages_are_truncated() {
        let mut surface = RecordingSurface::default();
        let long = "a very long status message that will not fit on the panel";
        let report = StatusReport::new(VoiceState::Ready, long);
        draw_panel(
            &mut surface,
            PanelRect::new(0, 0, 250, 200),
            "Voice AI",
            &report,
            None,
        );
        assert!(surface
            .texts
            .iter()
            .any(|t| t.ends_with("...") && t.len() < long.len()));
    }
}
