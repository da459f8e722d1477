use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
    Json,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            Some("json") => UiMode::Json,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        Self {
            mode: UiMode::parse(ui_flag),
            is_tty,
        }
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    fn pretty(&self) -> bool {
        match self.mode {
            UiMode::Pretty => true,
            UiMode::Auto => self.is_tty,
            UiMode::Plain | UiMode::Json => false,
        }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
            let spinner = spinner("{spinner} {msg}");
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            if self.mode != UiMode::Json {
                eprintln!("==> {}", name);
            }
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Live display for a continuously updated multi-line status.
    pub fn status_board(&self) -> StatusBoard {
        let spinner = self
            .pretty()
            .then(|| spinner("{spinner} {wide_msg}"));
        StatusBoard {
            spinner,
            json: self.mode == UiMode::Json,
            last: None,
        }
    }
}

fn spinner(template: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style =
        ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
}

pub struct StatusBoard {
    spinner: Option<ProgressBar>,
    json: bool,
    last: Option<String>,
}

impl StatusBoard {
    /// Show `text` unless it matches what is already displayed.
    pub fn show(&mut self, text: String) {
        if self.last.as_deref() == Some(text.as_str()) {
            return;
        }
        match &self.spinner {
            Some(spinner) => spinner.set_message(text.clone()),
            None if self.json => println!("{text}"),
            None => eprintln!("{text}\n"),
        }
        self.last = Some(text);
    }

    pub fn finish(self, message: &str) {
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None if self.json => {}
            None => eprintln!("{message}"),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            log::debug!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
