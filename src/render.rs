//! Render surface: a pure mapping from the reconciled view to what the
//! terminal shows. No clock, no I/O.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::frame_source::FrameView;
use crate::prediction::{Prediction, ThreatStatus};
use crate::reconciler::{StreamPhase, ViewState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Indicator {
    Idle,
    Connecting,
    Live,
    Stale,
    Retrying {
        attempt: u32,
        #[serde(rename = "delay_ms", serialize_with = "serialize_millis")]
        delay: Duration,
    },
    Terminated,
}

impl Indicator {
    pub fn headline(&self) -> String {
        match self {
            Indicator::Idle => "idle".to_string(),
            Indicator::Connecting => "connecting…".to_string(),
            Indicator::Live => "live".to_string(),
            Indicator::Stale => "stale: no predictions received".to_string(),
            Indicator::Retrying { attempt, delay } => format!(
                "disconnected, retrying in {} (attempt {})",
                format_delay(*delay),
                attempt
            ),
            Indicator::Terminated => "stream closed".to_string(),
        }
    }

    pub fn tone(&self) -> Tone {
        match self {
            Indicator::Live => Tone::Good,
            Indicator::Stale | Indicator::Retrying { .. } => Tone::Warning,
            Indicator::Idle | Indicator::Connecting | Indicator::Terminated => Tone::Muted,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Good,
    Warning,
    Alert,
    Muted,
}

/// Whether the shown prediction describes the stream right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Current,
    Stale,
    LastKnown,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictionLine {
    pub label: String,
    pub confidence: String,
    pub status: ThreatStatus,
    pub tone: Tone,
    pub freshness: Freshness,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPanel {
    pub indicator: Indicator,
    pub headline: String,
    pub tone: Tone,
    pub prediction: Option<PredictionLine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoPane {
    pub source: String,
    pub caption: String,
    pub healthy: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VisualOutput {
    pub video: VideoPane,
    pub status: StatusPanel,
}

pub fn render(view: &ViewState, frames: &FrameView) -> VisualOutput {
    let indicator = indicator_for(view);
    let freshness = match indicator {
        Indicator::Live => Freshness::Current,
        Indicator::Stale => Freshness::Stale,
        _ => Freshness::LastKnown,
    };
    VisualOutput {
        video: video_pane(frames),
        status: StatusPanel {
            headline: indicator.headline(),
            tone: indicator.tone(),
            prediction: view
                .last_prediction
                .as_ref()
                .map(|prediction| prediction_line(prediction, freshness)),
            indicator,
        },
    }
}

pub fn indicator_for(view: &ViewState) -> Indicator {
    match view.phase {
        StreamPhase::Idle => Indicator::Idle,
        StreamPhase::Connecting => Indicator::Connecting,
        StreamPhase::Live if view.is_stale => Indicator::Stale,
        StreamPhase::Live => Indicator::Live,
        StreamPhase::Stalled => Indicator::Stale,
        StreamPhase::Retrying => {
            let (attempt, delay) = view
                .retry
                .map(|plan| (plan.attempt, plan.delay))
                .unwrap_or((0, Duration::ZERO));
            Indicator::Retrying { attempt, delay }
        }
        StreamPhase::Terminated => Indicator::Terminated,
    }
}

/// `0.92` renders as `92.00%`.
pub fn format_confidence(confidence: f64) -> String {
    format!("{:.2}%", confidence * 100.0)
}

fn prediction_line(prediction: &Prediction, freshness: Freshness) -> PredictionLine {
    let tone = match prediction.threat_status() {
        ThreatStatus::Threat => Tone::Alert,
        ThreatStatus::Normal => Tone::Good,
        ThreatStatus::Unknown => Tone::Muted,
    };
    PredictionLine {
        label: prediction.label().to_string(),
        confidence: format_confidence(prediction.confidence()),
        status: prediction.threat_status(),
        tone,
        freshness,
    }
}

fn video_pane(frames: &FrameView) -> VideoPane {
    let caption = if frames.url.is_empty() {
        "video disabled".to_string()
    } else if frames.frames_received == 0 {
        match &frames.last_error {
            Some(error) => format!("no video: {}", error),
            None => "waiting for video…".to_string(),
        }
    } else {
        let size = match frames.dimensions {
            Some((width, height)) => format!("{}x{}, ", width, height),
            None => String::new(),
        };
        let state = if frames.healthy { "" } else { ", stalled" };
        format!(
            "{} frames ({}{} KiB last){}",
            frames.frames_received,
            size,
            frames.last_frame_bytes / 1024,
            state
        )
    };
    VideoPane {
        source: frames.url.clone(),
        caption,
        healthy: frames.healthy,
    }
}

fn format_delay(delay: Duration) -> String {
    if delay.as_secs() >= 1 && delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{}ms", delay.as_millis())
    }
}

fn serialize_millis<S>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(delay.as_millis() as u64)
}

impl fmt::Display for VisualOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", tone_marker(self.status.tone), self.status.headline)?;
        match &self.status.prediction {
            Some(line) => {
                let prefix = match line.freshness {
                    Freshness::Current => "",
                    Freshness::Stale => "(stale) ",
                    Freshness::LastKnown => "(last known) ",
                };
                writeln!(
                    f,
                    "  {}{} {} [{}]",
                    prefix, line.label, line.confidence, line.status
                )?;
            }
            None => writeln!(f, "  no prediction yet")?,
        }
        write!(f, "  video: {}", self.video.caption)
    }
}

fn tone_marker(tone: Tone) -> &'static str {
    match tone {
        Tone::Good => " ok ",
        Tone::Warning => "warn",
        Tone::Alert => "ALRT",
        Tone::Muted => " .. ",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::RetryPlan;
    use crate::transport::{ConnectionState, Generation};
    use std::time::Instant;

    fn live_view(prediction: Option<Prediction>) -> ViewState {
        ViewState {
            phase: StreamPhase::Live,
            connection: ConnectionState::Connected,
            last_prediction: prediction,
            last_updated_at: Instant::now(),
            is_stale: false,
            generation: Generation::new(1),
            retry: None,
            revision: 3,
        }
    }

    fn person() -> Prediction {
        Prediction::new("person", 0.92, ThreatStatus::Threat)
    }

    #[test]
    fn formats_confidence_with_two_decimals() {
        assert_eq!(format_confidence(0.92), "92.00%");
        assert_eq!(format_confidence(0.0), "0.00%");
        assert_eq!(format_confidence(1.0), "100.00%");
        assert_eq!(format_confidence(0.12345), "12.35%");
    }

    #[test]
    fn renders_live_threat() {
        let output = render(&live_view(Some(person())), &FrameView::disabled());
        assert_eq!(output.status.indicator, Indicator::Live);
        let line = output.status.prediction.expect("prediction shown");
        assert_eq!(line.label, "person");
        assert_eq!(line.confidence, "92.00%");
        assert_eq!(line.tone, Tone::Alert);
        assert_eq!(line.freshness, Freshness::Current);
    }

    #[test]
    fn fresh_stale_retrying_and_terminated_are_distinct() {
        let fresh = live_view(Some(person()));

        let mut stale = fresh.clone();
        stale.phase = StreamPhase::Stalled;
        stale.is_stale = true;

        let mut retrying = fresh.clone();
        retrying.phase = StreamPhase::Retrying;
        retrying.connection = ConnectionState::Disconnected;
        retrying.retry = Some(RetryPlan {
            attempt: 2,
            delay: Duration::from_secs(2),
        });

        let mut terminated = fresh.clone();
        terminated.phase = StreamPhase::Terminated;
        terminated.connection = ConnectionState::Disconnected;

        let frames = FrameView::disabled();
        let outputs: Vec<VisualOutput> = [&fresh, &stale, &retrying, &terminated]
            .iter()
            .map(|view| render(view, &frames))
            .collect();

        for (i, a) in outputs.iter().enumerate() {
            for b in outputs.iter().skip(i + 1) {
                assert_ne!(a.status.indicator, b.status.indicator);
                assert_ne!(a.status.headline, b.status.headline);
                assert_ne!(a.to_string(), b.to_string());
            }
        }
        assert_eq!(
            outputs[2].status.indicator,
            Indicator::Retrying {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert!(outputs[2].status.headline.contains("retrying in 2s"));
    }

    #[test]
    fn disconnected_prediction_is_last_known() {
        let mut view = live_view(Some(person()));
        view.phase = StreamPhase::Retrying;
        view.retry = Some(RetryPlan {
            attempt: 1,
            delay: Duration::from_secs(1),
        });
        let output = render(&view, &FrameView::disabled());
        let line = output.status.prediction.as_ref().expect("kept");
        assert_eq!(line.freshness, Freshness::LastKnown);
        assert!(output.to_string().contains("(last known) person 92.00%"));
    }

    #[test]
    fn unknown_status_differs_from_normal() {
        let unknown = render(
            &live_view(Some(Prediction::new("cat", 0.5, ThreatStatus::Unknown))),
            &FrameView::disabled(),
        );
        let normal = render(
            &live_view(Some(Prediction::new("cat", 0.5, ThreatStatus::Normal))),
            &FrameView::disabled(),
        );
        let unknown_line = unknown.status.prediction.as_ref().expect("unknown");
        let normal_line = normal.status.prediction.as_ref().expect("normal");
        assert_ne!(unknown_line.tone, normal_line.tone);
        assert_ne!(unknown.to_string(), normal.to_string());
    }

    #[test]
    fn video_caption_reports_frames() {
        let frames = FrameView {
            url: "http://127.0.0.1:8000/video_feed".to_string(),
            frames_received: 12,
            last_frame_bytes: 4096,
            dimensions: Some((640, 480)),
            healthy: true,
            last_error: None,
        };
        let output = render(&live_view(None), &frames);
        assert_eq!(output.video.caption, "12 frames (640x480, 4 KiB last)");
        assert!(output.to_string().contains("no prediction yet"));
    }

    #[test]
    fn serializes_for_json_output() {
        let mut view = live_view(Some(person()));
        view.phase = StreamPhase::Retrying;
        view.retry = Some(RetryPlan {
            attempt: 3,
            delay: Duration::from_millis(4000),
        });
        let output = render(&view, &FrameView::disabled());
        let value = serde_json::to_value(&output).expect("serialize");
        assert_eq!(value["status"]["indicator"]["kind"], "retrying");
        assert_eq!(value["status"]["indicator"]["delay_ms"], 4000);
        assert_eq!(value["status"]["prediction"]["status"], "Threat");
    }
}
