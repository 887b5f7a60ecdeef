use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use webground_core::{ContentExtractor, Error, ExtractedContent, ExtractionMethod, Result};

use crate::BROWSER_USER_AGENT;

/// Serialized DOM after scripts ran.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Node binary (`node` on PATH by default).
    pub node_bin: String,
    /// `NODE_PATH` for the child; `None` leaves the inherited environment alone.
    pub node_path: Option<String>,
    pub navigation_timeout: Duration,
    /// Added to `navigation_timeout` to get the wall-clock limit for the whole child.
    pub hard_timeout_grace: Duration,
    pub no_sandbox: bool,
    pub max_html_bytes: usize,
    /// Fail every call immediately.
    pub disabled: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            node_bin: "node".to_string(),
            node_path: None,
            navigation_timeout: Duration::from_secs(30),
            hard_timeout_grace: Duration::from_secs(10),
            no_sandbox: false,
            max_html_bytes: 5_000_000,
            disabled: false,
        }
    }
}

fn node_path_candidates() -> Vec<PathBuf> {
    // Best-effort Node global module roots across common setups.
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".npm-global").join("lib").join("node_modules"));
    }
    out.push(PathBuf::from("/opt/homebrew/lib/node_modules"));
    out.push(PathBuf::from("/usr/local/lib/node_modules"));
    out.push(PathBuf::from("/usr/lib/node_modules"));
    out
}

fn node_path_has_playwright(np: &str) -> bool {
    np.split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|p| PathBuf::from(p).join("playwright").is_dir())
}

fn npm_root_g() -> Option<String> {
    let out = std::process::Command::new("npm")
        .args(["root", "-g"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    node_path_has_playwright(&s).then_some(s)
}

/// Find a `NODE_PATH` under which `require('playwright')` resolves.
///
/// An explicit override wins. Returns `None` when the inherited `NODE_PATH` already works or
/// nothing was found. Blocking (may run `npm root -g`); call once at startup.
pub fn detect_node_path(explicit: Option<&str>) -> Option<String> {
    if let Some(v) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(v.to_string());
    }

    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if node_path_has_playwright(&existing) {
        return None;
    }

    let found = npm_root_g().or_else(|| {
        node_path_candidates()
            .into_iter()
            .find(|root| root.join("playwright").is_dir())
            .map(|root| root.to_string_lossy().to_string())
    })?;

    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

// stdout is JSON-only; the browser is closed on every path out of main().
const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message, hint) { ok({ ok: false, error: { code, message, hint } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args', ''); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured',
      'Playwright is not installed for Node.js (require("playwright") failed)',
      'Install it with `npm i -g playwright` and then `npx playwright install chromium`.');
  }

  const url = String(req.url || '').trim();
  if (!url) return bad('invalid_params', 'url must be non-empty', '');
  const timeoutMs = Number(req.timeout_ms || 30000);

  const t0 = Date.now();
  let browser;
  try {
    const launchOpts = { headless: true };
    if (req.no_sandbox) launchOpts.args = ['--no-sandbox', '--disable-setuid-sandbox'];
    browser = await pw.chromium.launch(launchOpts);
    const context = await browser.newContext({ userAgent: String(req.user_agent || ''), serviceWorkers: 'block' });
    const page = await context.newPage();
    // Images, media and fonts never carry text.
    try {
      await page.route('**/*', (route) => {
        const rt = route.request().resourceType();
        if (rt === 'image' || rt === 'media' || rt === 'font') return route.abort();
        return route.continue();
      });
    } catch (_) {}

    const resp = await page.goto(url, { waitUntil: 'networkidle', timeout: timeoutMs });
    const html = await page.content();
    ok({ ok: true, final_url: page.url(), status: resp ? resp.status() : null, html, elapsed_ms: Date.now() - t0 });
  } catch (e) {
    bad('render_failed', String(e && e.message ? e.message : e), '');
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('render_failed', String(e && e.message ? e.message : e), ''));
"#;

/// Last tier: headless Chromium per call, DOM read once the network is idle.
#[derive(Debug, Clone, Default)]
pub struct RenderedExtractor {
    opts: RenderOptions,
}

impl RenderedExtractor {
    pub fn new(opts: RenderOptions) -> Self {
        Self { opts }
    }

    /// A tier that always fails; for environments without Node or a browser.
    pub fn disabled() -> Self {
        Self::new(RenderOptions {
            disabled: true,
            ..RenderOptions::default()
        })
    }

    pub fn options(&self) -> &RenderOptions {
        &self.opts
    }

    fn hard_timeout(&self) -> Duration {
        self.opts
            .navigation_timeout
            .saturating_add(self.opts.hard_timeout_grace)
    }

    pub async fn render_html(&self, url: &url::Url) -> Result<RenderedPage> {
        if self.opts.disabled {
            return Err(Error::Render(
                "render tier disabled (WEBGROUND_RENDER_DISABLE)".to_string(),
            ));
        }

        let args_json = serde_json::json!({
            "url": url.as_str(),
            "timeout_ms": self.opts.navigation_timeout.as_millis() as u64,
            "user_agent": BROWSER_USER_AGENT,
            "no_sandbox": self.opts.no_sandbox,
        })
        .to_string();

        let mut cmd = tokio::process::Command::new(&self.opts.node_bin);
        if let Some(node_path) = &self.opts.node_path {
            cmd.env("NODE_PATH", node_path);
        }
        // The child leads its own process group so teardown reaches the browser it launches.
        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Render(format!(
                    "could not launch `{}` (Node.js with the Playwright package is required): {e}",
                    self.opts.node_bin
                ))
            })?;
        tracing::debug!(url = %url, node = %self.opts.node_bin, "render child spawned");
        // Dropped on every exit path, including a cancelled caller.
        let _group = ProcessGroupKill::new(child.id());

        if let Some(mut stdin) = child.stdin.take() {
            // A failed write shows up as a JSON error from the script.
            let _ = stdin.write_all(args_json.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        // `wait_with_output` consumes the child, which prevents killing it on timeout.
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Render("missing stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Render("missing stderr pipe".to_string()))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
            buf
        });

        let hard_timeout = self.hard_timeout();
        if let Err(e) = match tokio::time::timeout(hard_timeout, child.wait()).await {
            Ok(r) => r,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Render(format!(
                    "hard timeout after {}ms",
                    hard_timeout.as_millis()
                )));
            }
        } {
            return Err(Error::Render(format!("waiting for render child failed: {e}")));
        }

        let out_stdout = stdout_task.await.unwrap_or_default();
        let out_stderr = stderr_task.await.unwrap_or_default();
        parse_render_output(&out_stdout, &out_stderr, url, self.opts.max_html_bytes)
    }
}

/// SIGKILLs a render child's whole process group (node and any browser it started) on drop.
struct ProcessGroupKill {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }
}

impl Drop for ProcessGroupKill {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid.and_then(|p| libc::pid_t::try_from(p).ok()) {
                // ESRCH (group already gone) is the normal case after a clean exit.
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }
    }
}

fn parse_render_output(
    stdout: &[u8],
    stderr: &[u8],
    url: &url::Url,
    max_html_bytes: usize,
) -> Result<RenderedPage> {
    // Non-zero exits still print JSON on stdout.
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    let v: serde_json::Value = serde_json::from_str(&stdout).map_err(|e| {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        if stderr.is_empty() {
            Error::Render(format!("render child returned invalid JSON: {e}"))
        } else {
            Error::Render(format!(
                "render child returned invalid JSON: {e}. stderr: {stderr}"
            ))
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("render_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("render failed");
        let hint = v
            .pointer("/error/hint")
            .and_then(|x| x.as_str())
            .unwrap_or("")
            .trim();
        return Err(Error::Render(if hint.is_empty() {
            format!("{code}: {message}")
        } else {
            format!("{code}: {message}. {hint}")
        }));
    }

    let mut html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.trim().is_empty() {
        return Err(Error::Render("render returned empty HTML".to_string()));
    }
    if html.len() > max_html_bytes {
        let mut cut = max_html_bytes;
        while !html.is_char_boundary(cut) {
            cut -= 1;
        }
        html.truncate(cut);
        tracing::debug!(url = %url, max_html_bytes, "rendered html truncated");
    }

    Ok(RenderedPage {
        final_url: v
            .get("final_url")
            .and_then(|x| x.as_str())
            .unwrap_or(url.as_str())
            .to_string(),
        status: v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16),
        html,
        elapsed_ms: v.get("elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0),
    })
}

#[async_trait::async_trait]
impl ContentExtractor for RenderedExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Rendered
    }

    async fn extract(&self, url: &url::Url) -> Result<ExtractedContent> {
        let page = self.render_html(url).await?;
        tracing::debug!(url = %url, final_url = %page.final_url, status = ?page.status, elapsed_ms = page.elapsed_ms, "rendered");
        let url_s = url.to_string();
        tokio::task::spawn_blocking(move || crate::extract::extract_from_html(&page.html, &url_s))
            .await
            .map_err(|e| Error::Render(format!("render parse join failed: {e}")))
    }
}
