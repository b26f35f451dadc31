// ═══════════════════════════════════════════════════════════════════════════════
// VIPWATCH - REWARD TIER UNLOCK WATCHER
// Polls a task-status endpoint until the target tier unlocks, then fires
// device notifications. Session rotation | Proxy rotation | Anti-Detection
// ═══════════════════════════════════════════════════════════════════════════════

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// LAZY COMPILED REGEX (compile once, reuse everywhere)
// ═══════════════════════════════════════════════════════════════════════════════
static PROXY_LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:https?|socks[45])://)?[\w.\-]+:\d{2,5}$").unwrap()
});

// ═══════════════════════════════════════════════════════════════════════════════
// CLI ARGUMENTS
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Parser, Debug)]
#[command(name = "vipwatch")]
#[command(version)]
#[command(about = "Watches a reward tier until it unlocks, then notifies the device", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Account identifier (overrides config accounts)
    #[arg(long)]
    account: Option<String>,

    /// Pre-hashed account secret (pairs with --account)
    #[arg(long)]
    pwd: Option<String>,

    /// Tier name to watch
    #[arg(short, long)]
    tier: Option<String>,

    /// Fixed check interval in seconds (sets both ends of the range)
    #[arg(short, long)]
    interval: Option<u64>,

    /// How many notifications to fire when the tier unlocks
    #[arg(short, long)]
    notify_times: Option<u32>,

    /// Proxy list file (one proxy per line)
    #[arg(long)]
    proxy_file: Option<PathBuf>,

    /// Append plain log lines to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Disable proxy usage even if a list is configured
    #[arg(long, default_value_t = false)]
    no_proxy: bool,

    /// Run in quiet mode (less output)
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Debug, Clone, Deserialize)]
struct Account {
    account: String,
    pwd: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    accounts: Option<Vec<Account>>,
    login_url: Option<String>,
    task_url: Option<String>,
    task_ids: Option<Vec<u64>>,
    tier: Option<String>,
    interval_min_secs: Option<u64>,
    interval_max_secs: Option<u64>,
    jitter_secs: Option<u64>,
    min_delay_secs: Option<u64>,
    notify_times: Option<u32>,
    notify_gap_secs: Option<u64>,
    login_retries: Option<u32>,
    login_backoff_ms: Option<u64>,
    session_lifetime_mins: Option<u64>,
    proxy_rotate_every: Option<u64>,
    long_break_every_min: Option<u64>,
    long_break_every_max: Option<u64>,
    long_break_mins: Option<u64>,
    unlock_cooldown_mins: Option<u64>,
    error_cooldown_mins: Option<u64>,
    recovery_wait_secs: Option<u64>,
    predelay_ms: Option<u64>,
    timeout_secs: Option<u64>,
    reauth_fatal: Option<bool>,
    proxy_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

async fn load_file_config(path: Option<PathBuf>) -> FileConfig {
    if let Some(p) = path {
        if let Ok(content) = tokio::fs::read_to_string(&p).await {
            if let Ok(cfg) = toml::from_str(&content) {
                println!("{}", format!("[✓] Config loaded from {:?}", p).green());
                return cfg;
            }
        }
        println!("{}", format!("[!] Could not read config {:?}, using defaults", p).yellow());
        return FileConfig::default();
    }

    // Try default locations
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let default_paths = vec![
        PathBuf::from("vipwatch.toml"),
        PathBuf::from(format!("{}/.config/vipwatch/config.toml", home)),
        PathBuf::from(format!("{}/vipwatch.toml", home)),
    ];

    for p in default_paths {
        if let Ok(content) = tokio::fs::read_to_string(&p).await {
            if let Ok(cfg) = toml::from_str(&content) {
                println!("{}", format!("[✓] Config loaded from {:?}", p).green());
                return cfg;
            }
        }
    }

    FileConfig::default()
}

/// Fully resolved runtime configuration (file values overridden by CLI flags).
#[derive(Debug, Clone)]
struct Config {
    accounts: Vec<Account>,
    login_url: String,
    task_url: String,
    task_ids: Vec<u64>,
    tier: String,
    interval_min_secs: u64,
    interval_max_secs: u64,
    jitter_secs: u64,
    min_delay_secs: u64,
    notify_times: u32,
    notify_gap_secs: u64,
    login_retries: u32,
    login_backoff_ms: u64,
    session_lifetime_mins: u64,
    proxy_rotate_every: u64,
    long_break_every_min: u64,
    long_break_every_max: u64,
    long_break_mins: u64,
    unlock_cooldown_mins: u64,
    error_cooldown_mins: u64,
    recovery_wait_secs: u64,
    predelay_ms: u64,
    timeout_secs: u64,
    reauth_fatal: bool,
    proxy_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    quiet: bool,
}

impl Config {
    fn resolve(file: FileConfig, args: &Args) -> Self {
        let mut accounts = file.accounts.unwrap_or_default();
        if let (Some(account), Some(pwd)) = (args.account.clone(), args.pwd.clone()) {
            accounts = vec![Account { account, pwd }];
        }

        let interval_min = args.interval.or(file.interval_min_secs).unwrap_or(45);
        let interval_max = args.interval.or(file.interval_max_secs).unwrap_or(90);

        Self {
            accounts,
            login_url: file
                .login_url
                .unwrap_or_else(|| "https://api.primevideo.pw/api/user/login?lang=eng".to_string()),
            task_url: file
                .task_url
                .unwrap_or_else(|| "https://api.primevideo.pw/api/task/task_info?d={id}".to_string()),
            task_ids: file
                .task_ids
                .filter(|ids| !ids.is_empty())
                .unwrap_or_else(|| vec![1_755_184_676_245]),
            tier: args.tier.clone().or(file.tier).unwrap_or_else(|| "VIP1".to_string()),
            interval_min_secs: interval_min,
            interval_max_secs: interval_max.max(interval_min),
            jitter_secs: file.jitter_secs.unwrap_or(10),
            min_delay_secs: file.min_delay_secs.unwrap_or(15),
            notify_times: args.notify_times.or(file.notify_times).unwrap_or(5),
            notify_gap_secs: file.notify_gap_secs.unwrap_or(2),
            login_retries: file.login_retries.unwrap_or(3),
            login_backoff_ms: file.login_backoff_ms.unwrap_or(3000),
            session_lifetime_mins: file.session_lifetime_mins.unwrap_or(30),
            proxy_rotate_every: file.proxy_rotate_every.unwrap_or(10),
            long_break_every_min: file.long_break_every_min.unwrap_or(25),
            long_break_every_max: file.long_break_every_max.unwrap_or(40),
            long_break_mins: file.long_break_mins.unwrap_or(4),
            unlock_cooldown_mins: file.unlock_cooldown_mins.unwrap_or(10),
            error_cooldown_mins: file.error_cooldown_mins.unwrap_or(15),
            recovery_wait_secs: file.recovery_wait_secs.unwrap_or(60),
            predelay_ms: file.predelay_ms.unwrap_or(2500),
            timeout_secs: file.timeout_secs.unwrap_or(20),
            reauth_fatal: file.reauth_fatal.unwrap_or(false),
            proxy_file: if args.no_proxy {
                None
            } else {
                args.proxy_file.clone().or(file.proxy_file)
            },
            log_file: args.log_file.clone().or(file.log_file),
            quiet: args.quiet,
        }
    }

    fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime_mins * 60)
    }

    fn notify_title(&self) -> String {
        format!("{} Status", self.tier)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICE PROFILES WITH CLIENT HINTS
// ═══════════════════════════════════════════════════════════════════════════════
struct DeviceProfile {
    ua_template: &'static str,
    platform: &'static str,
    mobile: bool,
    brands: &'static str,
}

const PROFILES: &[DeviceProfile] = &[
    DeviceProfile {
        ua_template: "Mozilla/5.0 (Linux; Android 13; SM-A137F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.{} Mobile Safari/537.36",
        platform: "Android",
        mobile: true,
        brands: r#""Chromium";v="{}","Google Chrome";v="{}","Not=A?Brand";v="24""#,
    },
    DeviceProfile {
        ua_template: "Mozilla/5.0 (Linux; Android 14; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.{} Mobile Safari/537.36",
        platform: "Android",
        mobile: true,
        brands: r#""Chromium";v="{}","Google Chrome";v="{}","Not=A?Brand";v="24""#,
    },
    DeviceProfile {
        ua_template: "Mozilla/5.0 (Linux; Android 13; Redmi Note 11) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.{} Mobile Safari/537.36",
        platform: "Android",
        mobile: true,
        brands: r#""Chromium";v="{}","Google Chrome";v="{}","Not=A?Brand";v="24""#,
    },
    DeviceProfile {
        ua_template: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
        platform: "iOS",
        mobile: true,
        brands: r#""Safari";v="17","Not=A?Brand";v="24""#,
    },
    DeviceProfile {
        ua_template: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.{} Safari/537.36",
        platform: "Windows",
        mobile: false,
        brands: r#""Chromium";v="{}","Google Chrome";v="{}","Not=A?Brand";v="24""#,
    },
    DeviceProfile {
        ua_template: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.{}.{} Safari/537.36",
        platform: "Linux",
        mobile: false,
        brands: r#""Chromium";v="{}","Google Chrome";v="{}","Not=A?Brand";v="24""#,
    },
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.9,hi;q=0.8",
    "en-IN,en;q=0.9,hi;q=0.8",
    "es-ES,es;q=0.9,en;q=0.8",
    "pt-BR,pt;q=0.9,en;q=0.8",
    "fr-FR,fr;q=0.9,en;q=0.8",
];

const APP_PATHS: &[&str] = &["/", "/#/home", "/#/task", "/#/vip"];

/// Build a randomized outbound header set with client hints, so repeated
/// requests do not share one static fingerprint.
fn random_headers(rng: &mut impl Rng, origin: Option<&str>) -> reqwest::header::HeaderMap {
    let profile = &PROFILES[rng.gen_range(0..PROFILES.len())];
    let chrome_major: u32 = rng.gen_range(122..131);
    let chrome_build: u32 = rng.gen_range(1000..6000);
    let chrome_patch: u32 = rng.gen_range(1..200);

    let ua = profile
        .ua_template
        .replacen("{}", &chrome_major.to_string(), 1)
        .replacen("{}", &chrome_build.to_string(), 1)
        .replacen("{}", &chrome_patch.to_string(), 1);

    let brands = profile
        .brands
        .replacen("{}", &chrome_major.to_string(), 1)
        .replacen("{}", &chrome_major.to_string(), 1);

    let accept_lang = ACCEPT_LANGUAGES[rng.gen_range(0..ACCEPT_LANGUAGES.len())];

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("User-Agent", ua.parse().unwrap());
    headers.insert("Accept", "application/json, text/plain, */*".parse().unwrap());
    headers.insert("Accept-Encoding", "gzip, deflate, br".parse().unwrap());
    headers.insert("Accept-Language", accept_lang.parse().unwrap());
    headers.insert("Cache-Control", "no-cache".parse().unwrap());
    headers.insert("Pragma", "no-cache".parse().unwrap());

    if let Some(origin) = origin {
        let path = APP_PATHS[rng.gen_range(0..APP_PATHS.len())];
        headers.insert("Origin", origin.parse().unwrap());
        headers.insert("Referer", format!("{}{}", origin, path).parse().unwrap());
    }

    // Client Hints (modern browsers)
    if profile.platform != "iOS" {
        headers.insert("Sec-CH-UA", brands.parse().unwrap());
        headers.insert("Sec-CH-UA-Mobile", if profile.mobile { "?1" } else { "?0" }.parse().unwrap());
        headers.insert("Sec-CH-UA-Platform", format!("\"{}\"", profile.platform).parse().unwrap());
        headers.insert("Sec-Fetch-Dest", "empty".parse().unwrap());
        headers.insert("Sec-Fetch-Mode", "cors".parse().unwrap());
        headers.insert("Sec-Fetch-Site", "same-site".parse().unwrap());
    }

    headers
}

fn site_origin(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JOURNAL (console + best-effort log file)
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Debug, Clone)]
struct Journal {
    file: Option<PathBuf>,
    quiet: bool,
}

impl Journal {
    fn new(file: Option<PathBuf>, quiet: bool) -> Self {
        Self { file, quiet }
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", format!("[*] {}", msg).cyan());
        }
        self.append(msg);
    }

    fn good(&self, msg: &str) {
        if !self.quiet {
            println!("{}", format!("[✓] {}", msg).green());
        }
        self.append(msg);
    }

    fn warn(&self, msg: &str) {
        println!("{}", format!("[!] {}", msg).yellow());
        self.append(msg);
    }

    fn fail(&self, msg: &str) {
        println!("{}", format!("[x] {}", msg).red());
        self.append(msg);
    }

    fn append(&self, msg: &str) {
        let Some(path) = &self.file else { return };
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        use std::io::Write;
        let line = format!("{} {}\n", ts, msg);
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROXY ROTATOR
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Debug, Default)]
struct ProxyRotator {
    proxies: Vec<String>,
    index: usize,
}

impl ProxyRotator {
    fn new(proxies: Vec<String>) -> Self {
        Self { proxies, index: 0 }
    }

    /// Read one proxy URI per line; bare host:port lines become http://.
    /// A missing or unreadable file degrades to no-proxy mode.
    async fn load(path: Option<&PathBuf>, journal: &Journal) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                journal.warn(&format!("Proxy list {:?} unreadable ({}), continuing without proxy", path, e));
                return Self::default();
            }
        };
        let proxies: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| PROXY_LINE_REGEX.is_match(l))
            .map(|l| {
                if l.contains("://") {
                    l.to_string()
                } else {
                    format!("http://{}", l)
                }
            })
            .collect();
        journal.good(&format!("Loaded {} proxies from {:?}", proxies.len(), path));
        Self::new(proxies)
    }

    fn current(&self) -> Option<&str> {
        self.proxies.get(self.index).map(String::as_str)
    }

    fn rotate(&mut self) {
        if !self.proxies.is_empty() {
            self.index = (self.index + 1) % self.proxies.len();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR TAXONOMY
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Error, Debug)]
enum CheckError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
enum AuthError {
    #[error("login failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: CheckError },
}

/// Tri-state outcome of one status check. Errors degrade into this value and
/// never cross the poller boundary as panics or Err.
#[derive(Debug)]
enum PollStatus {
    Unlocked,
    Locked,
    Error(CheckError),
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKOFF + ERROR-NOTIFICATION THROTTLE
// ═══════════════════════════════════════════════════════════════════════════════
/// Bounded-retry backoff: base doubles per attempt, plus a random offset.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    base_ms: u64,
    jitter_ms: u64,
}

impl Backoff {
    fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let widened = self.base_ms.saturating_mul(1u64 << attempt.min(6));
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(widened + jitter)
    }
}

/// Gate on how often error notifications may fire, so a flapping endpoint
/// does not turn into a notification storm.
#[derive(Debug)]
struct ErrorThrottle {
    last_sent: Option<Instant>,
    cooldown: Duration,
}

impl ErrorThrottle {
    fn new(cooldown: Duration) -> Self {
        Self { last_sent: None, cooldown }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last_sent {
            Some(prev) if now.duration_since(prev) < self.cooldown => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOTIFICATION SINK
// ═══════════════════════════════════════════════════════════════════════════════
trait NotifySink {
    async fn notify(&self, title: &str, message: &str);
}

impl<T: NotifySink> NotifySink for Arc<T> {
    async fn notify(&self, title: &str, message: &str) {
        (**self).notify(title, message).await;
    }
}

fn is_termux() -> bool {
    std::env::var("PREFIX").map(|p| p.contains("com.termux")).unwrap_or(false)
        || std::path::Path::new("/data/data/com.termux").exists()
}

/// Fire-and-forget device notifier: notification + vibration + toast under
/// Termux, notify-send elsewhere. Sink failures are logged, never escalated.
struct DeviceNotifier {
    termux: bool,
    journal: Journal,
}

impl DeviceNotifier {
    fn detect(journal: Journal) -> Self {
        Self { termux: is_termux(), journal }
    }

    async fn run_sink(&self, program: &str, args: &[&str]) {
        let result = tokio::process::Command::new(program).args(args).output().await;
        match result {
            Ok(out) if out.status.success() => {}
            Ok(out) => self.journal.warn(&format!("{} exited with {}", program, out.status)),
            Err(e) => self.journal.warn(&format!("{} failed: {}", program, e)),
        }
    }
}

impl NotifySink for DeviceNotifier {
    async fn notify(&self, title: &str, message: &str) {
        if self.termux {
            self.run_sink("termux-notification", &["--title", title, "--content", message]).await;
            self.run_sink("termux-vibrate", &["-d", "500"]).await;
            self.run_sink("termux-toast", &[message]).await;
        } else {
            self.run_sink("notify-send", &[title, message]).await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION AUTHENTICATOR
// ═══════════════════════════════════════════════════════════════════════════════
/// Short-lived bearer session. Replaced wholesale on re-authentication,
/// never mutated in place.
#[derive(Debug)]
struct Session {
    token: String,
    cookies: HashMap<String, String>,
    created: Instant,
}

impl Session {
    fn expired(&self, lifetime: Duration) -> bool {
        self.created.elapsed() >= lifetime
    }

    fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ");
        Some(joined)
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    data: Option<LoginData>,
}

#[derive(Deserialize)]
struct LoginData {
    token: Option<String>,
}

fn build_client(timeout_secs: u64, proxy: Option<&str>) -> Result<reqwest::Client, CheckError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs));
    if let Some(addr) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(addr)?);
    }
    Ok(builder.build()?)
}

async fn login_attempt(
    cfg: &Config,
    cred: &Account,
    proxy: Option<&str>,
    rng: &mut impl Rng,
) -> Result<Session, CheckError> {
    let client = build_client(cfg.timeout_secs, proxy)?;
    let origin = site_origin(&cfg.login_url);
    let headers = random_headers(rng, origin.as_deref());

    let payload = serde_json::json!({
        "account": cred.account,
        "code": "",
        "pwd": cred.pwd,
    });

    let resp = client
        .post(&cfg.login_url)
        .headers(headers)
        .json(&payload)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        return Err(CheckError::Protocol(format!("login returned {}", status)));
    }

    let mut cookies = HashMap::new();
    for value in resp.headers().get_all(reqwest::header::SET_COOKIE) {
        if let Ok(raw) = value.to_str() {
            if let Some(pair) = raw.split(';').next() {
                if let Some((name, val)) = pair.split_once('=') {
                    cookies.insert(name.trim().to_string(), val.trim().to_string());
                }
            }
        }
    }

    let body: LoginResponse = resp
        .json()
        .await
        .map_err(|e| CheckError::Protocol(format!("malformed login body: {}", e)))?;

    let token = body
        .data
        .and_then(|d| d.token)
        .ok_or_else(|| CheckError::Protocol("login body missing data.token".to_string()))?;

    Ok(Session { token, cookies, created: Instant::now() })
}

/// Exchange credentials for a bearer session. Bounded retries with widening
/// randomized backoff; the proxy rotates between failed attempts. Exhausting
/// the bound is terminal here, escalation is the orchestrator's call.
async fn authenticate(
    cfg: &Config,
    cred: &Account,
    rotator: &mut ProxyRotator,
    rng: &mut impl Rng,
    journal: &Journal,
) -> Result<Session, AuthError> {
    let backoff = Backoff {
        base_ms: cfg.login_backoff_ms,
        jitter_ms: cfg.login_backoff_ms / 2,
    };
    let attempts = cfg.login_retries.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        match login_attempt(cfg, cred, rotator.current(), rng).await {
            Ok(session) => {
                journal.good(&format!(
                    "Login OK for {} on attempt {} (token {}...)",
                    cred.account,
                    attempt + 1,
                    &session.token.chars().take(8).collect::<String>()
                ));
                return Ok(session);
            }
            Err(e) => {
                journal.warn(&format!("Login attempt {}/{} failed: {}", attempt + 1, attempts, e));
                last = Some(e);
                rotator.rotate();
                if attempt + 1 < attempts {
                    sleep(backoff.delay(attempt, rng)).await;
                }
            }
        }
    }

    Err(AuthError::Exhausted {
        attempts,
        last: last.unwrap_or_else(|| CheckError::Protocol("no attempt made".to_string())),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATUS POLLER
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Deserialize)]
struct TaskInfoResponse {
    data: Option<TaskData>,
}

#[derive(Deserialize)]
struct TaskData {
    level_list: Option<Vec<LevelEntry>>,
}

#[derive(Deserialize)]
struct LevelEntry {
    name: Option<String>,
    #[serde(default)]
    is_unlock: UnlockFlag,
}

/// The endpoint has been seen emitting 0/1 and occasionally booleans.
#[derive(Deserialize)]
#[serde(untagged)]
enum UnlockFlag {
    Int(i64),
    Bool(bool),
}

impl Default for UnlockFlag {
    fn default() -> Self {
        UnlockFlag::Int(0)
    }
}

impl UnlockFlag {
    fn truthy(&self) -> bool {
        match self {
            UnlockFlag::Int(n) => *n != 0,
            UnlockFlag::Bool(b) => *b,
        }
    }
}

/// Pure evaluation of a task-info body against the target tier.
fn evaluate_body(body: &str, tier: &str) -> PollStatus {
    let parsed: TaskInfoResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => return PollStatus::Error(CheckError::Protocol(format!("malformed body: {}", e))),
    };

    let levels = match parsed.data.and_then(|d| d.level_list) {
        Some(l) => l,
        None => return PollStatus::Error(CheckError::Protocol("missing data.level_list".to_string())),
    };

    match levels.iter().find(|l| l.name.as_deref() == Some(tier)) {
        Some(entry) if entry.is_unlock.truthy() => PollStatus::Unlocked,
        Some(_) => PollStatus::Locked,
        None => PollStatus::Error(CheckError::Protocol(format!("tier {} not in level_list", tier))),
    }
}

/// One status check: pick a task shard, wait a short randomized pre-delay,
/// query with the bearer token and current proxy, evaluate the body.
async fn check_tier(
    cfg: &Config,
    session: &Session,
    rotator: &ProxyRotator,
    rng: &mut impl Rng,
) -> PollStatus {
    let predelay = rng.gen_range(0..cfg.predelay_ms.max(1));
    sleep(Duration::from_millis(predelay)).await;

    let task_id = match cfg.task_ids.choose(rng) {
        Some(id) => *id,
        None => return PollStatus::Error(CheckError::Protocol("no task ids configured".to_string())),
    };
    let url = cfg.task_url.replace("{id}", &task_id.to_string());

    let client = match build_client(cfg.timeout_secs, rotator.current()) {
        Ok(c) => c,
        Err(e) => return PollStatus::Error(e),
    };

    let origin = site_origin(&cfg.task_url);
    let mut headers = random_headers(rng, origin.as_deref());
    match format!("Bearer {}", session.token).parse() {
        Ok(v) => {
            headers.insert(reqwest::header::AUTHORIZATION, v);
        }
        Err(_) => {
            return PollStatus::Error(CheckError::Protocol("token not header-safe".to_string()));
        }
    }
    if let Some(cookie) = session.cookie_header() {
        if let Ok(v) = cookie.parse() {
            headers.insert(reqwest::header::COOKIE, v);
        }
    }

    let resp = match client.get(&url).headers(headers).send().await {
        Ok(r) => r,
        Err(e) => return PollStatus::Error(CheckError::Transport(e)),
    };

    let status = resp.status();
    if !status.is_success() {
        return PollStatus::Error(CheckError::Protocol(format!("task_info returned {}", status)));
    }

    let body = match resp.text().await {
        Ok(b) => b,
        Err(e) => return PollStatus::Error(CheckError::Transport(e)),
    };

    evaluate_body(&body, &cfg.tier)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DELAYS
// ═══════════════════════════════════════════════════════════════════════════════
/// Next inter-check delay: base drawn from the configured range, a smaller
/// symmetric jitter on top, clamped to the floor.
fn next_delay(cfg: &Config, rng: &mut impl Rng) -> Duration {
    let base = rng.gen_range(cfg.interval_min_secs..=cfg.interval_max_secs.max(cfg.interval_min_secs));
    let jitter = rng.gen_range(-(cfg.jitter_secs as i64)..=cfg.jitter_secs as i64);
    let secs = (base as i64 + jitter).max(cfg.min_delay_secs as i64) as u64;
    Duration::from_secs(secs)
}

/// Sleep in short slices so a shutdown request is observed between blocking
/// calls. Returns true once shutdown has been requested.
async fn pause(dur: Duration, shutdown: &AtomicBool) -> bool {
    let mut left = dur;
    while !left.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return true;
        }
        let step = left.min(Duration::from_millis(500));
        sleep(step).await;
        left = left.saturating_sub(step);
    }
    shutdown.load(Ordering::Relaxed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// POLL ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════════
struct Orchestrator<N: NotifySink> {
    cfg: Config,
    rotator: ProxyRotator,
    throttle: ErrorThrottle,
    notifier: N,
    journal: Journal,
    shutdown: Arc<AtomicBool>,
    rng: rand::rngs::StdRng,
    checks: u64,
    conclusive: u64,
}

impl<N: NotifySink> Orchestrator<N> {
    fn new(cfg: Config, rotator: ProxyRotator, notifier: N, journal: Journal, shutdown: Arc<AtomicBool>) -> Self {
        let throttle = ErrorThrottle::new(Duration::from_secs(cfg.error_cooldown_mins * 60));
        Self {
            cfg,
            rotator,
            throttle,
            notifier,
            journal,
            shutdown,
            rng: rand::rngs::StdRng::from_entropy(),
            checks: 0,
            conclusive: 0,
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn draw_break_budget(&mut self) -> u64 {
        let lo = self.cfg.long_break_every_min.max(1);
        let hi = self.cfg.long_break_every_max.max(lo);
        self.rng.gen_range(lo..=hi)
    }

    /// Inconclusive checks do not advance the rotation cadence; an upstream
    /// outage would otherwise burn through the proxy list.
    fn register_outcome(&mut self, status: &PollStatus) {
        self.checks += 1;
        if matches!(status, PollStatus::Error(_)) {
            return;
        }
        self.conclusive += 1;
        if self.cfg.proxy_rotate_every > 0 && self.conclusive % self.cfg.proxy_rotate_every == 0 {
            self.rotator.rotate();
            if let Some(p) = self.rotator.current() {
                self.journal.info(&format!("Rotated proxy -> {}", p));
            }
        }
    }

    async fn login_session(&mut self) -> Result<Session, AuthError> {
        // New credential drawn at random each time a session is acquired.
        let cred = self
            .cfg
            .accounts
            .choose(&mut self.rng)
            .cloned()
            .expect("accounts checked non-empty at startup");
        authenticate(&self.cfg, &cred, &mut self.rotator, &mut self.rng, &self.journal).await
    }

    async fn unlock_burst(&mut self) {
        let title = self.cfg.notify_title();
        let message = format!("{} is now unlocked!", self.cfg.tier);
        self.journal.good(&format!("{}, sending {} notifications", message, self.cfg.notify_times));
        for n in 0..self.cfg.notify_times {
            self.notifier.notify(&title, &message).await;
            if n + 1 < self.cfg.notify_times
                && pause(Duration::from_secs(self.cfg.notify_gap_secs), &self.shutdown).await
            {
                return;
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        let title = self.cfg.notify_title();

        let mut session = match self.login_session().await {
            Ok(s) => s,
            Err(e) => {
                self.journal.fail(&format!("{}", e));
                self.notifier
                    .notify(&title, &format!("Failed to login, {} watcher stopped", self.cfg.tier))
                    .await;
                return Err(e.into());
            }
        };

        let mut until_break = self.draw_break_budget();

        loop {
            if self.interrupted() {
                self.journal.info("Stopped manually");
                self.notifier.notify(&title, "Watcher stopped manually").await;
                return Ok(());
            }

            if session.expired(self.cfg.session_lifetime()) {
                self.journal.info("Session lifetime exceeded, re-authenticating");
                match self.login_session().await {
                    Ok(s) => session = s,
                    Err(e) => {
                        if self.cfg.reauth_fatal {
                            self.journal.fail(&format!("{}", e));
                            self.notifier
                                .notify(&title, &format!("Re-login failed, {} watcher stopped", self.cfg.tier))
                                .await;
                            return Err(e.into());
                        }
                        // Non-fatal mid-run: wait out the recovery window and retry.
                        self.journal.warn(&format!("Re-login failed ({}), retrying after recovery wait", e));
                        if self.throttle.allow() {
                            self.notifier.notify(&title, &format!("Re-login failing: {}", e)).await;
                        }
                        pause(Duration::from_secs(self.cfg.recovery_wait_secs), &self.shutdown).await;
                        continue;
                    }
                }
            }

            let status = check_tier(&self.cfg, &session, &self.rotator, &mut self.rng).await;
            self.register_outcome(&status);

            match status {
                PollStatus::Unlocked => {
                    self.unlock_burst().await;
                    // Already-known-unlocked: back off hard before polling again.
                    self.journal.info(&format!(
                        "Cooling down {} min before resuming checks",
                        self.cfg.unlock_cooldown_mins
                    ));
                    pause(Duration::from_secs(self.cfg.unlock_cooldown_mins * 60), &self.shutdown).await;
                    continue;
                }
                PollStatus::Locked => {
                    self.journal.info(&format!("{} still locked (check #{})", self.cfg.tier, self.checks));
                }
                PollStatus::Error(e) => {
                    self.journal.warn(&format!("Check #{} inconclusive: {}", self.checks, e));
                    if self.throttle.allow() {
                        self.notifier.notify(&title, &format!("Status checks failing: {}", e)).await;
                    }
                }
            }

            until_break = until_break.saturating_sub(1);
            if until_break == 0 {
                self.journal.info(&format!("Idle break for {} min", self.cfg.long_break_mins));
                pause(Duration::from_secs(self.cfg.long_break_mins * 60), &self.shutdown).await;
                until_break = self.draw_break_budget();
            } else {
                pause(next_delay(&self.cfg, &mut self.rng), &self.shutdown).await;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════════════════════
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let file_cfg = load_file_config(args.config.clone()).await;
    let cfg = Config::resolve(file_cfg, &args);

    if cfg.accounts.is_empty() {
        anyhow::bail!("no credentials configured: set [[accounts]] in vipwatch.toml or pass --account/--pwd");
    }

    let env_type = if is_termux() { "TERMUX" } else { "DESKTOP" };
    if !cfg.quiet {
        println!("{}", format!("=== VIPWATCH - {} ===", env_type).magenta().bold());
        println!("{}", format!("[✓] Watching tier: {}", cfg.tier).green());
        println!(
            "{}",
            format!(
                "[✓] Interval: {}-{}s (jitter ±{}s), {} accounts",
                cfg.interval_min_secs, cfg.interval_max_secs, cfg.jitter_secs, cfg.accounts.len()
            )
            .green()
        );
    }

    let journal = Journal::new(cfg.log_file.clone(), cfg.quiet);
    let rotator = ProxyRotator::load(cfg.proxy_file.as_ref(), &journal).await;
    if rotator.current().is_none() {
        journal.info("No proxies configured, connecting directly");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_signal.store(true, Ordering::Relaxed);
        }
    });

    let notifier = DeviceNotifier::detect(journal.clone());
    let mut orchestrator = Orchestrator::new(cfg, rotator, notifier, journal, shutdown);

    orchestrator
        .run()
        .await
        .context("watcher terminated on unrecoverable error")
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config {
            accounts: vec![Account { account: "watcher@test".to_string(), pwd: "abc123".to_string() }],
            login_url: "http://127.0.0.1:9/login".to_string(),
            task_url: "http://127.0.0.1:9/task?d={id}".to_string(),
            task_ids: vec![1],
            tier: "VIP1".to_string(),
            interval_min_secs: 1,
            interval_max_secs: 1,
            jitter_secs: 0,
            min_delay_secs: 0,
            notify_times: 3,
            notify_gap_secs: 0,
            login_retries: 3,
            login_backoff_ms: 1,
            session_lifetime_mins: 60,
            proxy_rotate_every: 10,
            long_break_every_min: 1000,
            long_break_every_max: 1000,
            long_break_mins: 1,
            unlock_cooldown_mins: 1,
            error_cooldown_mins: 15,
            recovery_wait_secs: 1,
            predelay_ms: 1,
            timeout_secs: 5,
            reauth_fatal: false,
            proxy_file: None,
            log_file: None,
            quiet: true,
        }
    }

    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { messages: Mutex::new(Vec::new()) })
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl NotifySink for RecordingSink {
        async fn notify(&self, _title: &str, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    // ── body evaluation ──────────────────────────────────────────────────────

    #[test]
    fn unlocked_flag_yields_unlocked() {
        let body = r#"{"data":{"level_list":[{"name":"VIP0","is_unlock":1},{"name":"VIP1","is_unlock":1}]}}"#;
        assert!(matches!(evaluate_body(body, "VIP1"), PollStatus::Unlocked));
    }

    #[test]
    fn boolean_flag_is_accepted() {
        let body = r#"{"data":{"level_list":[{"name":"VIP1","is_unlock":true}]}}"#;
        assert!(matches!(evaluate_body(body, "VIP1"), PollStatus::Unlocked));
    }

    #[test]
    fn zero_flag_yields_locked() {
        let body = r#"{"data":{"level_list":[{"name":"VIP1","is_unlock":0}]}}"#;
        assert!(matches!(evaluate_body(body, "VIP1"), PollStatus::Locked));
    }

    #[test]
    fn missing_flag_defaults_to_locked() {
        let body = r#"{"data":{"level_list":[{"name":"VIP1"}]}}"#;
        assert!(matches!(evaluate_body(body, "VIP1"), PollStatus::Locked));
    }

    #[test]
    fn missing_tier_is_an_error() {
        let body = r#"{"data":{"level_list":[{"name":"VIP2","is_unlock":1}]}}"#;
        assert!(matches!(evaluate_body(body, "VIP1"), PollStatus::Error(_)));
    }

    #[test]
    fn missing_level_list_is_an_error() {
        assert!(matches!(evaluate_body(r#"{"data":{}}"#, "VIP1"), PollStatus::Error(_)));
        assert!(matches!(evaluate_body(r#"{"code":401}"#, "VIP1"), PollStatus::Error(_)));
    }

    #[test]
    fn malformed_body_is_an_error_not_a_panic() {
        assert!(matches!(evaluate_body("<html>502</html>", "VIP1"), PollStatus::Error(_)));
        assert!(matches!(evaluate_body("", "VIP1"), PollStatus::Error(_)));
    }

    // ── proxy rotation ───────────────────────────────────────────────────────

    #[test]
    fn rotation_is_cyclic() {
        let mut rotator = ProxyRotator::new(vec![
            "http://10.0.0.1:8080".to_string(),
            "http://10.0.0.2:8080".to_string(),
            "socks5://10.0.0.3:1080".to_string(),
        ]);
        let first = rotator.current().unwrap().to_string();
        for _ in 0..3 {
            rotator.rotate();
        }
        assert_eq!(rotator.current().unwrap(), first);
    }

    #[test]
    fn empty_list_means_no_proxy_and_noop_rotate() {
        let mut rotator = ProxyRotator::default();
        assert!(rotator.current().is_none());
        rotator.rotate();
        assert!(rotator.current().is_none());
    }

    #[test]
    fn inconclusive_checks_do_not_advance_proxy_rotation() {
        let mut cfg = test_config();
        cfg.proxy_rotate_every = 1;
        let rotator = ProxyRotator::new(vec![
            "http://10.0.0.1:8080".to_string(),
            "http://10.0.0.2:8080".to_string(),
        ]);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut orchestrator =
            Orchestrator::new(cfg, rotator, RecordingSink::new(), Journal::new(None, true), shutdown);

        orchestrator.register_outcome(&PollStatus::Error(CheckError::Protocol("boom".to_string())));
        orchestrator.register_outcome(&PollStatus::Error(CheckError::Protocol("boom".to_string())));
        assert_eq!(orchestrator.rotator.current().unwrap(), "http://10.0.0.1:8080");

        orchestrator.register_outcome(&PollStatus::Locked);
        assert_eq!(orchestrator.rotator.current().unwrap(), "http://10.0.0.2:8080");
    }

    #[test]
    fn proxy_lines_are_filtered_and_normalized() {
        let lines = ["10.0.0.1:8080", "socks5://10.0.0.2:1080", "not a proxy", ""];
        let proxies: Vec<String> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| PROXY_LINE_REGEX.is_match(l))
            .map(|l| if l.contains("://") { l.to_string() } else { format!("http://{}", l) })
            .collect();
        assert_eq!(proxies, vec!["http://10.0.0.1:8080", "socks5://10.0.0.2:1080"]);
    }

    // ── config resolution ────────────────────────────────────────────────────

    #[test]
    fn empty_task_id_list_falls_back_to_default() {
        let file = FileConfig { task_ids: Some(Vec::new()), ..FileConfig::default() };
        let cfg = Config::resolve(file, &Args::parse_from(["vipwatch"]));
        assert!(!cfg.task_ids.is_empty());
    }

    // ── delays, backoff, throttle ────────────────────────────────────────────

    #[test]
    fn jittered_delay_never_goes_below_floor() {
        let mut cfg = test_config();
        cfg.interval_min_secs = 1;
        cfg.interval_max_secs = 3;
        cfg.jitter_secs = 10;
        cfg.min_delay_secs = 5;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..500 {
            assert!(next_delay(&cfg, &mut rng) >= Duration::from_secs(5));
        }
    }

    #[test]
    fn backoff_widens_per_attempt_within_bounds() {
        let backoff = Backoff { base_ms: 100, jitter_ms: 50 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for attempt in 0..4u32 {
            let lo = 100 * (1 << attempt);
            for _ in 0..50 {
                let d = backoff.delay(attempt, &mut rng).as_millis() as u64;
                assert!(d >= lo && d <= lo + 50, "attempt {} delay {} out of range", attempt, d);
            }
        }
    }

    #[test]
    fn error_throttle_gates_within_cooldown() {
        let mut throttle = ErrorThrottle::new(Duration::from_millis(50));
        assert!(throttle.allow());
        assert!(!throttle.allow());
        std::thread::sleep(Duration::from_millis(60));
        assert!(throttle.allow());
    }

    // ── authenticator against a mock endpoint ────────────────────────────────

    #[tokio::test]
    async fn authenticate_captures_token_and_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "sid=xyz; Path=/; HttpOnly")
                    .set_body_json(serde_json::json!({"data": {"token": "tok-123"}})),
            )
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        let mut rotator = ProxyRotator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let journal = Journal::new(None, true);

        let cred = cfg.accounts[0].clone();
        let session = authenticate(&cfg, &cred, &mut rotator, &mut rng, &journal)
            .await
            .unwrap();
        assert_eq!(session.token, "tok-123");
        assert_eq!(session.cookies.get("sid").map(String::as_str), Some("xyz"));
    }

    #[tokio::test]
    async fn authenticate_exhausts_after_bounded_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        let mut rotator = ProxyRotator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let journal = Journal::new(None, true);

        let cred = cfg.accounts[0].clone();
        let err = authenticate(&cfg, &cred, &mut rotator, &mut rng, &journal)
            .await
            .unwrap_err();
        let AuthError::Exhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
        server.verify().await;
    }

    #[tokio::test]
    async fn missing_token_field_counts_as_failed_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .expect(3)
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        let mut rotator = ProxyRotator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let journal = Journal::new(None, true);

        let cred = cfg.accounts[0].clone();
        let result = authenticate(&cfg, &cred, &mut rotator, &mut rng, &journal).await;
        assert!(result.is_err());
        server.verify().await;
    }

    // ── poller against a mock endpoint ───────────────────────────────────────

    async fn poll_once(server: &MockServer) -> PollStatus {
        let mut cfg = test_config();
        cfg.task_url = format!("{}/task?d={{id}}", server.uri());
        let session = Session {
            token: "tok".to_string(),
            cookies: HashMap::new(),
            created: Instant::now(),
        };
        let rotator = ProxyRotator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        check_tier(&cfg, &session, &rotator, &mut rng).await
    }

    #[tokio::test]
    async fn poll_degrades_http_errors_to_poll_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(matches!(poll_once(&server).await, PollStatus::Error(_)));
    }

    #[tokio::test]
    async fn poll_with_no_task_ids_degrades_to_error() {
        let mut cfg = test_config();
        cfg.task_ids.clear();
        let session = Session {
            token: "tok".to_string(),
            cookies: HashMap::new(),
            created: Instant::now(),
        };
        let rotator = ProxyRotator::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let status = check_tier(&cfg, &session, &rotator, &mut rng).await;
        assert!(matches!(status, PollStatus::Error(CheckError::Protocol(_))));
    }

    #[tokio::test]
    async fn poll_reports_unlocked_tier() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"level_list": [{"name": "VIP1", "is_unlock": 1}]}
            })))
            .mount(&server)
            .await;
        assert!(matches!(poll_once(&server).await, PollStatus::Unlocked));
    }

    // ── end-to-end orchestrator scenarios ────────────────────────────────────

    #[tokio::test]
    async fn fatal_auth_failure_notifies_once_and_never_polls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(401))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        cfg.task_url = format!("{}/task?d={{id}}", server.uri());

        let sink = RecordingSink::new();
        let journal = Journal::new(None, true);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut orchestrator =
            Orchestrator::new(cfg, ProxyRotator::default(), sink.clone(), journal, shutdown);

        assert!(orchestrator.run().await.is_err());
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Failed to login"));
        server.verify().await;
    }

    #[tokio::test]
    async fn unlock_fires_burst_then_cools_down() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"token": "tok-123"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"level_list": [{"name": "VIP1", "is_unlock": 1}]}
            })))
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        cfg.task_url = format!("{}/task?d={{id}}", server.uri());
        cfg.notify_times = 3;
        cfg.notify_gap_secs = 0;
        // Cooldown far longer than the test window: the burst must fire once.
        cfg.unlock_cooldown_mins = 10;

        let sink = RecordingSink::new();
        let journal = Journal::new(None, true);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            stop.store(true, Ordering::Relaxed);
        });

        let mut orchestrator =
            Orchestrator::new(cfg, ProxyRotator::default(), sink.clone(), journal, shutdown);
        orchestrator.run().await.unwrap();

        let messages = sink.messages();
        let unlocks = messages.iter().filter(|m| m.contains("unlocked")).count();
        assert_eq!(unlocks, 3, "exactly one burst during the cooldown window: {:?}", messages);
        assert!(messages.last().unwrap().contains("stopped manually"));
    }

    #[tokio::test]
    async fn manual_stop_sends_final_notification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"token": "tok-123"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"level_list": [{"name": "VIP1", "is_unlock": 0}]}
            })))
            .mount(&server)
            .await;

        let mut cfg = test_config();
        cfg.login_url = format!("{}/login", server.uri());
        cfg.task_url = format!("{}/task?d={{id}}", server.uri());

        let sink = RecordingSink::new();
        let journal = Journal::new(None, true);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(800)).await;
            stop.store(true, Ordering::Relaxed);
        });

        let mut orchestrator =
            Orchestrator::new(cfg, ProxyRotator::default(), sink.clone(), journal, shutdown);
        orchestrator.run().await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("stopped manually"));
    }

    // ── headers ──────────────────────────────────────────────────────────────

    #[test]
    fn randomized_headers_carry_identity_and_fetch_metadata() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let headers = random_headers(&mut rng, Some("https://api.example.test"));
            assert!(headers.contains_key("User-Agent"));
            assert!(headers.contains_key("Accept-Language"));
            let referer = headers.get("Referer").unwrap().to_str().unwrap();
            assert!(referer.starts_with("https://api.example.test"));
        }
    }

    #[test]
    fn site_origin_strips_path_and_query() {
        assert_eq!(
            site_origin("https://api.primevideo.pw/api/user/login?lang=eng").as_deref(),
            Some("https://api.primevideo.pw")
        );
        assert_eq!(
            site_origin("http://127.0.0.1:8080/task?d=1").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert!(site_origin("not a url").is_none());
    }
}
