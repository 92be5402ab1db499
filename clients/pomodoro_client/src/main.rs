use clap::Parser;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    future::Future,
    io::Write,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::{JoinError, JoinHandle, JoinSet},
    time::Duration,
};
use tracing::{error, info, warn};

const DEFAULT_FOCUS_SECONDS: u64 = 25 * 60;
const DEFAULT_BREAK_SECONDS: u64 = 5 * 60;
const TICK: Duration = Duration::from_secs(1);
// Durations are stored server-side as i64 seconds.
const MAX_DURATION_MINUTES: u64 = i64::MAX as u64 / 60;

#[derive(Parser, Debug)]
#[command(name = "pomodoro_client", version)]
struct Args {
    /// Core base URL, e.g. http://127.0.0.1:17700
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    core_url: String,

    /// User id every session and query is recorded under.
    #[arg(long)]
    user: i64,

    /// Focus length (seconds). Overrides the stored user settings.
    #[arg(long)]
    focus_seconds: Option<u64>,

    /// Break length (seconds). Overrides the stored user settings.
    #[arg(long)]
    break_seconds: Option<u64>,

    /// A pause only records a partial session once more than this many seconds have elapsed.
    #[arg(long, default_value_t = 30)]
    pause_threshold_seconds: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TimerMode {
    Focus,
    Break,
}

impl TimerMode {
    fn opposite(self) -> Self {
        match self {
            TimerMode::Focus => TimerMode::Break,
            TimerMode::Break => TimerMode::Focus,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TimerMode::Focus => "FOCUS",
            TimerMode::Break => "BREAK",
        }
    }
}

/// Countdown state for one timer: `Idle(mode, time_left)` or `Running(mode, time_left)`.
///
/// Pure state; the one-second cadence lives in [`TimerEngine`].
#[derive(Clone, Debug)]
struct PomodoroTimer {
    focus_duration: u64,
    break_duration: u64,
    mode: TimerMode,
    time_left: u64,
    is_running: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TickOutcome {
    Counted(u64),
    /// The countdown hit zero; the timer has already switched to the opposite mode.
    Completed { mode: TimerMode, duration: u64 },
}

impl PomodoroTimer {
    fn new(focus_duration: u64, break_duration: u64) -> Self {
        let focus_duration = focus_duration.max(1);
        Self {
            focus_duration,
            break_duration: break_duration.max(1),
            mode: TimerMode::Focus,
            time_left: focus_duration,
            is_running: false,
        }
    }

    fn duration(&self, mode: TimerMode) -> u64 {
        match mode {
            TimerMode::Focus => self.focus_duration,
            TimerMode::Break => self.break_duration,
        }
    }

    fn start(&mut self) -> bool {
        if self.is_running || self.time_left == 0 {
            return false;
        }
        self.is_running = true;
        true
    }

    /// Returns seconds elapsed in the current mode, or `None` when not running.
    fn pause(&mut self) -> Option<u64> {
        if !self.is_running {
            return None;
        }
        self.is_running = false;
        Some(self.duration(self.mode).saturating_sub(self.time_left))
    }

    fn reset(&mut self) {
        self.is_running = false;
        self.time_left = self.duration(self.mode);
    }

    fn switch_mode(&mut self, mode: TimerMode) {
        self.is_running = false;
        self.mode = mode;
        self.time_left = self.duration(mode);
    }

    fn tick(&mut self) -> Option<TickOutcome> {
        if !self.is_running {
            return None;
        }
        self.time_left = self.time_left.saturating_sub(1);
        if self.time_left > 0 {
            return Some(TickOutcome::Counted(self.time_left));
        }

        let mode = self.mode;
        let duration = self.duration(mode);
        self.switch_mode(mode.opposite());
        Some(TickOutcome::Completed { mode, duration })
    }

    /// A running countdown keeps its `time_left`; new lengths apply from the next reset or switch.
    fn update_durations(&mut self, focus_duration: u64, break_duration: u64) -> bool {
        if focus_duration == 0 || break_duration == 0 {
            return false;
        }
        self.focus_duration = focus_duration;
        self.break_duration = break_duration;
        if !self.is_running {
            self.time_left = self.duration(self.mode);
        }
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerEvent {
    Tick { mode: TimerMode, time_left: u64 },
    Completed { mode: TimerMode, duration: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TimerSnapshot {
    mode: TimerMode,
    time_left: u64,
    is_running: bool,
}

struct Shared {
    timer: PomodoroTimer,
    // Bumped on every transition out of Running; a ticker only acts while its generation is current.
    generation: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives a [`PomodoroTimer`] with a single cancellable one-second ticker task.
struct TimerEngine {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    ticker: Option<JoinHandle<()>>,
}

impl TimerEngine {
    fn new(
        focus_duration: u64,
        break_duration: u64,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                timer: PomodoroTimer::new(focus_duration, break_duration),
                generation: 0,
            })),
            events,
            ticker: None,
        }
    }

    fn snapshot(&self) -> TimerSnapshot {
        let s = lock(&self.shared);
        TimerSnapshot {
            mode: s.timer.mode,
            time_left: s.timer.time_left,
            is_running: s.timer.is_running,
        }
    }

    fn duration(&self, mode: TimerMode) -> u64 {
        lock(&self.shared).timer.duration(mode)
    }

    fn start(&mut self) -> bool {
        let generation = {
            let mut s = lock(&self.shared);
            if !s.timer.start() {
                return false;
            }
            s.generation += 1;
            s.generation
        };
        self.cancel_ticker();
        self.ticker = Some(tokio::spawn(run_ticker(
            self.shared.clone(),
            self.events.clone(),
            generation,
        )));
        true
    }

    fn pause(&mut self) -> Option<u64> {
        self.cancel_ticker();
        let mut s = lock(&self.shared);
        s.generation += 1;
        s.timer.pause()
    }

    fn reset(&mut self) {
        self.cancel_ticker();
        let mut s = lock(&self.shared);
        s.generation += 1;
        s.timer.reset();
    }

    fn switch_mode(&mut self, mode: TimerMode) {
        self.cancel_ticker();
        let mut s = lock(&self.shared);
        s.generation += 1;
        s.timer.switch_mode(mode);
    }

    fn update_durations(&mut self, focus_duration: u64, break_duration: u64) -> bool {
        lock(&self.shared)
            .timer
            .update_durations(focus_duration, break_duration)
    }

    fn cancel_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        self.cancel_ticker();
    }
}

async fn run_ticker(
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    generation: u64,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
    loop {
        interval.tick().await;
        let outcome = {
            let mut s = lock(&shared);
            if s.generation != generation {
                return;
            }
            let mode = s.timer.mode;
            s.timer.tick().map(|o| (mode, o))
        };
        match outcome {
            Some((mode, TickOutcome::Counted(time_left))) => {
                let _ = events.send(TimerEvent::Tick { mode, time_left });
            }
            Some((mode, TickOutcome::Completed { duration, .. })) => {
                let _ = events.send(TimerEvent::Tick { mode, time_left: 0 });
                let _ = events.send(TimerEvent::Completed { mode, duration });
                return;
            }
            None => return,
        }
    }
}

fn format_time(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct NewSession {
    #[serde(rename = "type")]
    kind: TimerMode,
    duration: u64,
    completed: bool,
}

#[derive(Clone, Debug, Deserialize)]
struct RecordedSession {
    id: i64,
    duration: u64,
    completed: bool,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSettings {
    focus_seconds: u64,
    break_seconds: u64,
    sound_enabled: bool,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TodayStats {
    focus_minutes: u64,
    break_minutes: u64,
    sessions: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct ScheduleSuggestion {
    title: String,
    schedule: String,
    color: String,
}

/// Persists one immutable session record. Failures are returned, never retried.
trait SessionRecorder: Send + Sync + 'static {
    fn record_session(
        &self,
        user: i64,
        session: NewSession,
    ) -> impl Future<Output = anyhow::Result<RecordedSession>> + Send;
}

#[derive(Deserialize)]
struct OkResponse<T> {
    ok: bool,
    data: Option<T>,
}

async fn read_ok<T: DeserializeOwned>(res: reqwest::Response) -> anyhow::Result<T> {
    if !res.status().is_success() {
        anyhow::bail!("http_{}", res.status().as_u16());
    }
    let body: OkResponse<T> = res.json().await?;
    if !body.ok {
        anyhow::bail!("not_ok");
    }
    body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
}

async fn get_ok<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> anyhow::Result<T> {
    read_ok(client.get(url).send().await?).await
}

async fn post_ok<B: Serialize + ?Sized, T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> anyhow::Result<T> {
    read_ok(client.post(url).json(body).send().await?).await
}

/// HTTP access to focus_core for one user.
struct CoreClient {
    http: reqwest::Client,
    base_url: String,
    user: i64,
}

impl CoreClient {
    fn new(base_url: &str, user: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
        }
    }

    async fn settings(&self) -> anyhow::Result<StoredSettings> {
        get_ok(
            &self.http,
            &format!("{}/settings?user={}", self.base_url, self.user),
        )
        .await
    }

    async fn save_durations(&self, focus_seconds: u64, break_seconds: u64) -> anyhow::Result<StoredSettings> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Update {
            focus_seconds: u64,
            break_seconds: u64,
        }

        post_ok(
            &self.http,
            &format!("{}/settings?user={}", self.base_url, self.user),
            &Update {
                focus_seconds,
                break_seconds,
            },
        )
        .await
    }

    async fn today_stats(&self, tz_offset_minutes: i32) -> anyhow::Result<TodayStats> {
        get_ok(
            &self.http,
            &format!(
                "{}/sessions/stats/today?user={}&tz_offset_minutes={}",
                self.base_url, self.user, tz_offset_minutes
            ),
        )
        .await
    }

    async fn generate_schedule(
        &self,
        work_schedule: &str,
        extra_activities: &str,
        goals: &str,
    ) -> anyhow::Result<Vec<ScheduleSuggestion>> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Request<'a> {
            work_schedule: &'a str,
            extra_activities: &'a str,
            goals: &'a str,
        }

        #[derive(Deserialize)]
        struct Generated {
            schedule: Vec<ScheduleSuggestion>,
        }

        let generated: Generated = post_ok(
            &self.http,
            &format!("{}/schedule/generate", self.base_url),
            &Request {
                work_schedule,
                extra_activities,
                goals,
            },
        )
        .await?;
        Ok(generated.schedule)
    }

    async fn save_schedule_as_habits(
        &self,
        schedule: &[ScheduleSuggestion],
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        post_ok(
            &self.http,
            &format!("{}/habits/bulk?user={}", self.base_url, self.user),
            &serde_json::json!({ "schedule": schedule }),
        )
        .await
    }
}

impl SessionRecorder for CoreClient {
    fn record_session(
        &self,
        user: i64,
        session: NewSession,
    ) -> impl Future<Output = anyhow::Result<RecordedSession>> + Send {
        let http = self.http.clone();
        let url = format!("{}/sessions?user={}", self.base_url, user);
        async move { post_ok(&http, &url, &session).await }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Command {
    Start,
    Pause,
    Toggle,
    Reset,
    Mode(TimerMode),
    Durations {
        focus_minutes: u64,
        break_minutes: u64,
    },
    Status,
    Stats,
    Schedule {
        work_schedule: String,
        extra_activities: String,
        goals: String,
    },
    SaveSchedule,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Self> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));

        match word.to_lowercase().as_str() {
            "start" | "s" => Ok(Command::Start),
            "pause" | "p" => Ok(Command::Pause),
            "" | "toggle" | "t" => Ok(Command::Toggle),
            "reset" | "r" => Ok(Command::Reset),
            "focus" | "f" => Ok(Command::Mode(TimerMode::Focus)),
            "break" | "b" => Ok(Command::Mode(TimerMode::Break)),
            "status" => Ok(Command::Status),
            "stats" => Ok(Command::Stats),
            "save" => Ok(Command::SaveSchedule),
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            "durations" | "d" => {
                let mut parts = rest.split_whitespace().map(str::parse::<u64>);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(f)), Some(Ok(b)), None)
                        if (1..=MAX_DURATION_MINUTES).contains(&f)
                            && (1..=MAX_DURATION_MINUTES).contains(&b) =>
                    {
                        Ok(Command::Durations {
                            focus_minutes: f,
                            break_minutes: b,
                        })
                    }
                    _ => anyhow::bail!("usage: durations <focus minutes> <break minutes>"),
                }
            }
            "schedule" => {
                let mut parts = rest.splitn(3, '|').map(|p| p.trim().to_string());
                let work_schedule = parts.next().unwrap_or_default();
                let extra_activities = parts.next().unwrap_or_default();
                let goals = parts.next().unwrap_or_default();
                Ok(Command::Schedule {
                    work_schedule,
                    extra_activities,
                    goals,
                })
            }
            other => anyhow::bail!("unknown command '{other}' (try 'help')"),
        }
    }
}

/// Timer commands plus the session-recording contract around them.
struct App<R: SessionRecorder> {
    engine: TimerEngine,
    recorder: Arc<R>,
    user: i64,
    pause_threshold_seconds: u64,
    sound_enabled: bool,
    pending: JoinSet<anyhow::Result<RecordedSession>>,
}

impl<R: SessionRecorder> App<R> {
    fn new(
        engine: TimerEngine,
        recorder: Arc<R>,
        user: i64,
        pause_threshold_seconds: u64,
        sound_enabled: bool,
    ) -> Self {
        Self {
            engine,
            recorder,
            user,
            pause_threshold_seconds,
            sound_enabled,
            pending: JoinSet::new(),
        }
    }

    fn start(&mut self) -> bool {
        self.engine.start()
    }

    fn pause(&mut self) -> Option<u64> {
        let mode = self.engine.snapshot().mode;
        let elapsed = self.engine.pause()?;
        if elapsed > self.pause_threshold_seconds {
            self.record(mode, elapsed, false);
        }
        Some(elapsed)
    }

    fn toggle(&mut self) {
        if self.engine.snapshot().is_running {
            self.pause();
        } else {
            self.start();
        }
    }

    fn on_event(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Tick { mode, time_left } => {
                print!("\r{} {}   ", mode.label(), format_time(time_left));
                let _ = std::io::stdout().flush();
            }
            TimerEvent::Completed { mode, duration } => {
                println!();
                info!(mode = mode.label(), duration, "countdown completed");
                self.record(mode, duration, true);
                if self.sound_enabled {
                    notify_completion(mode);
                }
                self.print_status();
            }
        }
    }

    /// Fire-and-forget: the ticker never waits on this.
    fn record(&mut self, kind: TimerMode, duration: u64, completed: bool) {
        let recorder = self.recorder.clone();
        let user = self.user;
        let session = NewSession {
            kind,
            duration,
            completed,
        };
        self.pending
            .spawn(async move { recorder.record_session(user, session).await });
    }

    fn on_recorded(&mut self, result: Result<anyhow::Result<RecordedSession>, JoinError>) {
        match result {
            Ok(Ok(session)) => info!(
                id = session.id,
                duration = session.duration,
                completed = session.completed,
                "session saved"
            ),
            Ok(Err(err)) => {
                error!("record session failed: {err}");
                println!("\nCould not save the session. It was not recorded.");
            }
            Err(err) => error!("record session task failed: {err}"),
        }
    }

    fn print_status(&self) {
        let s = self.engine.snapshot();
        println!(
            "{} {} [{}]",
            s.mode.label(),
            format_time(s.time_left),
            if s.is_running { "running" } else { "idle" }
        );
    }
}

fn notify_completion(finished: TimerMode) {
    let (title, message) = match finished {
        TimerMode::Focus => ("Time for a break!", "Take a short rest."),
        TimerMode::Break => ("Time to focus!", "Back to work."),
    };

    #[cfg(windows)]
    {
        use win_toast_notify::WinToastNotify;

        let _ = WinToastNotify::new()
            .set_title(title)
            .set_messages(vec![message])
            .show();
    }

    #[cfg(not(windows))]
    {
        print!("\x07");
    }
    println!("{title} {message}");
}

fn local_tz_offset_minutes() -> i32 {
    chrono::Local::now().offset().local_minus_utc() / 60
}

fn print_help() {
    println!("Commands:");
    println!("  start | pause | <enter> (toggle) | reset");
    println!("  focus | break                    switch mode (discards the countdown)");
    println!("  durations <focus min> <break min>");
    println!("  status | stats");
    println!("  schedule <work> | <extra activities> | <goals>");
    println!("  save                             save the last schedule as habits");
    println!("  help | quit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pomodoro_client=info".into()),
        )
        .init();

    let args = Args::parse();
    if args.user <= 0 {
        anyhow::bail!("--user must be a positive id");
    }

    let core = Arc::new(CoreClient::new(&args.core_url, args.user));
    let stored = match core.settings().await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("could not load timer settings, using defaults: {e}");
            None
        }
    };

    let focus_seconds = args
        .focus_seconds
        .or(stored.map(|s| s.focus_seconds))
        .unwrap_or(DEFAULT_FOCUS_SECONDS)
        .max(1);
    let break_seconds = args
        .break_seconds
        .or(stored.map(|s| s.break_seconds))
        .unwrap_or(DEFAULT_BREAK_SECONDS)
        .max(1);
    let sound_enabled = stored.map(|s| s.sound_enabled).unwrap_or(true);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut app = App::new(
        TimerEngine::new(focus_seconds, break_seconds, events_tx),
        core.clone(),
        args.user,
        args.pause_threshold_seconds,
        sound_enabled,
    );

    info!(
        "Pomodoro client started for user {} against {}",
        args.user, core.base_url
    );
    print_help();
    app.print_status();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_schedule: Vec<ScheduleSuggestion> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let cmd = match Command::parse(&line) {
                    Ok(c) => c,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                if !handle_command(&mut app, &core, &mut last_schedule, cmd).await {
                    break;
                }
            }
            Some(event) = events_rx.recv() => app.on_event(event),
            Some(result) = app.pending.join_next(), if !app.pending.is_empty() => app.on_recorded(result),
        }
    }

    app.engine.pause();
    while let Some(result) = app.pending.join_next().await {
        app.on_recorded(result);
    }
    Ok(())
}

/// Returns `false` when the client should exit.
async fn handle_command(
    app: &mut App<CoreClient>,
    core: &CoreClient,
    last_schedule: &mut Vec<ScheduleSuggestion>,
    cmd: Command,
) -> bool {
    match cmd {
        Command::Start => {
            app.start();
            app.print_status();
        }
        Command::Pause => {
            app.pause();
            app.print_status();
        }
        Command::Toggle => {
            app.toggle();
            app.print_status();
        }
        Command::Reset => {
            app.engine.reset();
            app.print_status();
        }
        Command::Mode(mode) => {
            app.engine.switch_mode(mode);
            app.print_status();
        }
        Command::Durations {
            focus_minutes,
            break_minutes,
        } => {
            let (focus_seconds, break_seconds) = (focus_minutes * 60, break_minutes * 60);
            app.engine.update_durations(focus_seconds, break_seconds);
            if let Err(e) = core.save_durations(focus_seconds, break_seconds).await {
                warn!("save settings failed: {e}");
            }
            app.print_status();
        }
        Command::Status => app.print_status(),
        Command::Stats => match core.today_stats(local_tz_offset_minutes()).await {
            Ok(stats) => println!(
                "Today: {} pomodoros, focus {}:{:02}, break {}m",
                stats.sessions,
                stats.focus_minutes / 60,
                stats.focus_minutes % 60,
                stats.break_minutes
            ),
            Err(e) => {
                error!("fetch stats failed: {e}");
                println!("Could not load today's stats.");
            }
        },
        Command::Schedule {
            work_schedule,
            extra_activities,
            goals,
        } => match core
            .generate_schedule(&work_schedule, &extra_activities, &goals)
            .await
        {
            Ok(schedule) => {
                if schedule.is_empty() {
                    println!("Nothing to suggest.");
                }
                for item in &schedule {
                    println!("  {:<18} {}", item.title, item.schedule);
                }
                *last_schedule = schedule;
            }
            Err(e) => {
                error!("generate schedule failed: {e}");
                println!("Could not generate a schedule.");
            }
        },
        Command::SaveSchedule => {
            if last_schedule.is_empty() {
                println!("Generate a schedule first.");
            } else {
                match core.save_schedule_as_habits(last_schedule).await {
                    Ok(created) => println!("Saved {} habits.", created.len()),
                    Err(e) => {
                        error!("save habits failed: {e}");
                        println!("Could not save the habits.");
                    }
                }
            }
        }
        Command::Help => print_help(),
        Command::Quit => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockRecorder {
        fail: bool,
        recorded: Mutex<Vec<(i64, NewSession)>>,
    }

    impl SessionRecorder for MockRecorder {
        fn record_session(
            &self,
            user: i64,
            session: NewSession,
        ) -> impl Future<Output = anyhow::Result<RecordedSession>> + Send {
            self.recorded.lock().unwrap().push((user, session.clone()));
            let result = if self.fail {
                Err(anyhow::anyhow!("http_500"))
            } else {
                Ok(RecordedSession {
                    id: 1,
                    duration: session.duration,
                    completed: session.completed,
                })
            };
            async move { result }
        }
    }

    fn test_app(
        focus: u64,
        brk: u64,
        recorder: Arc<MockRecorder>,
    ) -> (App<MockRecorder>, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = App::new(TimerEngine::new(focus, brk, tx), recorder, 42, 30, false);
        (app, rx)
    }

    async fn next_tick(rx: &mut mpsc::UnboundedReceiver<TimerEvent>) -> u64 {
        match rx.recv().await.unwrap() {
            TimerEvent::Tick { time_left, .. } => time_left,
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn format_time_pads_minutes_and_seconds() {
        assert_eq!(format_time(125), "02:05");
        assert_eq!(format_time(0), "00:00");
        assert_eq!(format_time(1500), "25:00");
        assert_eq!(format_time(6000), "100:00");
    }

    #[test]
    fn timer_completes_exactly_once_after_duration_ticks() {
        for d in [1u64, 2, 5, 60] {
            let mut t = PomodoroTimer::new(d, 7);
            assert!(t.start());
            let outcomes: Vec<_> = (0..d).filter_map(|_| t.tick()).collect();
            assert_eq!(outcomes.len() as u64, d);
            for (i, o) in outcomes[..outcomes.len() - 1].iter().enumerate() {
                assert_eq!(*o, TickOutcome::Counted(d - 1 - i as u64));
            }
            assert_eq!(
                outcomes.last(),
                Some(&TickOutcome::Completed {
                    mode: TimerMode::Focus,
                    duration: d
                })
            );
            // Switched to the opposite mode at full length, idle.
            assert_eq!(t.mode, TimerMode::Break);
            assert_eq!(t.time_left, 7);
            assert!(!t.is_running);
            assert_eq!(t.tick(), None);
        }
    }

    #[test]
    fn break_completion_switches_back_to_focus() {
        let mut t = PomodoroTimer::new(10, 2);
        t.switch_mode(TimerMode::Break);
        t.start();
        t.tick();
        assert_eq!(
            t.tick(),
            Some(TickOutcome::Completed {
                mode: TimerMode::Break,
                duration: 2
            })
        );
        assert_eq!(t.mode, TimerMode::Focus);
        assert_eq!(t.time_left, 10);
        assert!(!t.is_running);
    }

    #[test]
    fn pause_then_start_resumes_from_paused_time() {
        let mut t = PomodoroTimer::new(100, 5);
        t.start();
        for _ in 0..40 {
            t.tick();
        }
        assert_eq!(t.pause(), Some(40));
        assert_eq!(t.time_left, 60);
        assert_eq!(t.pause(), None);
        assert_eq!(t.tick(), None);
        assert!(t.start());
        assert_eq!(t.tick(), Some(TickOutcome::Counted(59)));
    }

    #[test]
    fn start_is_idempotent() {
        let mut t = PomodoroTimer::new(100, 5);
        assert!(t.start());
        assert!(!t.start());
        assert_eq!(t.tick(), Some(TickOutcome::Counted(99)));
    }

    #[test]
    fn switch_mode_and_reset_always_land_idle_at_full_duration() {
        let mut t = PomodoroTimer::new(100, 5);
        t.start();
        t.tick();
        t.switch_mode(TimerMode::Break);
        assert_eq!((t.mode, t.time_left, t.is_running), (TimerMode::Break, 5, false));

        t.switch_mode(TimerMode::Break);
        assert_eq!((t.mode, t.time_left, t.is_running), (TimerMode::Break, 5, false));

        t.switch_mode(TimerMode::Focus);
        t.start();
        t.tick();
        t.tick();
        t.reset();
        assert_eq!((t.mode, t.time_left, t.is_running), (TimerMode::Focus, 100, false));
    }

    #[test]
    fn update_durations_defers_while_running() {
        let mut t = PomodoroTimer::new(100, 5);
        assert!(t.update_durations(200, 10));
        assert_eq!(t.time_left, 200);

        t.start();
        t.tick();
        assert!(t.update_durations(300, 20));
        assert_eq!(t.time_left, 199);

        t.reset();
        assert_eq!(t.time_left, 300);
        t.switch_mode(TimerMode::Break);
        assert_eq!(t.time_left, 20);

        assert!(!t.update_durations(0, 20));
        assert_eq!(t.focus_duration, 300);
    }

    #[test]
    fn command_parse() {
        assert_eq!(Command::parse("start").unwrap(), Command::Start);
        assert_eq!(Command::parse("").unwrap(), Command::Toggle);
        assert_eq!(Command::parse("B").unwrap(), Command::Mode(TimerMode::Break));
        assert_eq!(
            Command::parse("durations 45 10").unwrap(),
            Command::Durations {
                focus_minutes: 45,
                break_minutes: 10
            }
        );
        assert!(Command::parse("durations 0 5").is_err());
        assert!(Command::parse("durations 25").is_err());
        assert!(Command::parse("durations 307445734561825861 5").is_err());
        assert!(Command::parse("durations 5 307445734561825861").is_err());
        assert_eq!(
            Command::parse(&format!("durations {MAX_DURATION_MINUTES} 1")).unwrap(),
            Command::Durations {
                focus_minutes: MAX_DURATION_MINUTES,
                break_minutes: 1
            }
        );
        assert!(MAX_DURATION_MINUTES.checked_mul(60).is_some());
        assert_eq!(
            Command::parse("schedule school 8-14 | | gym and reading").unwrap(),
            Command::Schedule {
                work_schedule: "school 8-14".to_string(),
                extra_activities: String::new(),
                goals: "gym and reading".to_string(),
            }
        );
        assert!(Command::parse("dance").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_ticks_every_second_and_completes_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(3, 2, tx);
        assert!(engine.start());
        assert!(!engine.start());

        assert_eq!(next_tick(&mut rx).await, 2);
        assert_eq!(next_tick(&mut rx).await, 1);
        assert_eq!(next_tick(&mut rx).await, 0);
        assert_eq!(
            rx.recv().await,
            Some(TimerEvent::Completed {
                mode: TimerMode::Focus,
                duration: 3
            })
        );

        assert_eq!(
            engine.snapshot(),
            TimerSnapshot {
                mode: TimerMode::Break,
                time_left: 2,
                is_running: false
            }
        );

        // No auto-resume.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_pause_cancels_ticker_and_resume_continues() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(10, 5, tx);
        engine.start();
        assert_eq!(next_tick(&mut rx).await, 9);
        assert_eq!(next_tick(&mut rx).await, 8);

        assert_eq!(engine.pause(), Some(2));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.snapshot().time_left, 8);

        assert!(engine.start());
        assert_eq!(next_tick(&mut rx).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_switch_mode_discards_running_countdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(10, 5, tx);
        engine.start();
        assert_eq!(next_tick(&mut rx).await, 9);

        engine.switch_mode(TimerMode::Break);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(
            engine.snapshot(),
            TimerSnapshot {
                mode: TimerMode::Break,
                time_left: 5,
                is_running: false
            }
        );
        assert_eq!(engine.duration(TimerMode::Focus), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_reset_cancels_running_countdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(10, 5, tx);
        engine.start();
        assert_eq!(next_tick(&mut rx).await, 9);
        assert_eq!(next_tick(&mut rx).await, 8);

        engine.reset();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(
            engine.snapshot(),
            TimerSnapshot {
                mode: TimerMode::Focus,
                time_left: 10,
                is_running: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_running_engine_stops_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TimerEngine::new(10, 5, tx);
        engine.start();
        assert_eq!(next_tick(&mut rx).await, 9);

        drop(engine);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_past_threshold_records_partial_session() {
        let recorder = Arc::new(MockRecorder::default());
        let (mut app, mut rx) = test_app(100, 5, recorder.clone());
        app.start();
        for _ in 0..31 {
            next_tick(&mut rx).await;
        }
        assert_eq!(app.pause(), Some(31));

        let result = app.pending.join_next().await.unwrap();
        assert!(matches!(result, Ok(Ok(_))));
        let recorded = recorder.recorded.lock().unwrap();
        assert_eq!(
            recorded.as_slice(),
            &[(
                42,
                NewSession {
                    kind: TimerMode::Focus,
                    duration: 31,
                    completed: false
                }
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_pause_is_not_recorded() {
        let recorder = Arc::new(MockRecorder::default());
        let (mut app, mut rx) = test_app(100, 5, recorder.clone());
        app.start();
        for _ in 0..30 {
            next_tick(&mut rx).await;
        }
        assert_eq!(app.pause(), Some(30));
        assert!(app.pending.is_empty());
        assert!(recorder.recorded.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_records_full_session() {
        let recorder = Arc::new(MockRecorder::default());
        let (mut app, mut rx) = test_app(3, 2, recorder.clone());
        app.toggle();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, TimerEvent::Completed { .. });
            app.on_event(event);
            if done {
                break;
            }
        }
        let result = app.pending.join_next().await.unwrap();
        assert!(matches!(result, Ok(Ok(_))));
        assert_eq!(
            recorder.recorded.lock().unwrap().as_slice(),
            &[(
                42,
                NewSession {
                    kind: TimerMode::Focus,
                    duration: 3,
                    completed: true
                }
            )]
        );
        assert!(!app.engine.snapshot().is_running);
        assert_eq!(app.engine.snapshot().mode, TimerMode::Break);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recording_does_not_touch_countdown() {
        let recorder = Arc::new(MockRecorder {
            fail: true,
            ..MockRecorder::default()
        });
        let (mut app, mut rx) = test_app(100, 5, recorder.clone());
        app.start();
        for _ in 0..40 {
            next_tick(&mut rx).await;
        }
        app.pause();
        app.start();

        let result = app.pending.join_next().await.unwrap();
        assert!(matches!(result, Ok(Err(_))));
        app.on_recorded(result);

        assert_eq!(next_tick(&mut rx).await, 59);
        assert!(app.engine.snapshot().is_running);
    }
}
