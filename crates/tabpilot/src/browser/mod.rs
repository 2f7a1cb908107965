//! Browser session and frame capture capabilities.
//!
//! A [`BrowserSession`] hands out one [`BrowserTab`] per run. Frame capture is
//! a separate push stream so it can be swapped without touching tab handling.

use crate::error::{Error, Result};
use crate::model::TargetId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Connects to a browser remote-control endpoint.
#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>>;
}

/// Shared browser session. One tab per run.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_tab(&self) -> Result<Arc<dyn BrowserTab>>;

    /// Tabs opened through this session that are still open.
    fn tabs(&self) -> Vec<Arc<dyn BrowserTab>>;

    async fn close_all_tabs(&self) -> Result<()>;

    /// Release the session itself. Tabs are closed first.
    async fn close(&self) -> Result<()> {
        self.close_all_tabs().await
    }
}

#[async_trait]
pub trait BrowserTab: Send + Sync {
    fn target_id(&self) -> &TargetId;

    fn is_closed(&self) -> bool;

    fn current_url(&self) -> Option<String>;

    async fn close(&self) -> Result<()>;
}

/// One captured frame, base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: String,
    pub session_id: u64,
}

/// Push stream of frames for one tab.
#[async_trait]
pub trait CaptureStream: Send {
    /// Next frame, or `None` when the stream has ended.
    async fn next_frame(&mut self) -> Option<Frame>;

    async fn ack(&mut self, frame: &Frame) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FrameCapture: Send + Sync {
    async fn start(&self, tab: Arc<dyn BrowserTab>) -> Result<Box<dyn CaptureStream>>;
}

/// Capture provider that never produces frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCapture;

struct EmptyStream;

#[async_trait]
impl CaptureStream for EmptyStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        None
    }

    async fn ack(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FrameCapture for NoCapture {
    async fn start(&self, _tab: Arc<dyn BrowserTab>) -> Result<Box<dyn CaptureStream>> {
        Ok(Box::new(EmptyStream))
    }
}

/// Browser provider for agents that attach to the browser themselves.
///
/// Sessions only keep bookkeeping: tabs get synthetic target ids and closing
/// them just flips a flag.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetachedBrowser;

#[async_trait]
impl BrowserProvider for DetachedBrowser {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrowserSession>> {
        if endpoint.trim().is_empty() {
            return Err(Error::browser("browser endpoint is empty"));
        }
        tracing::debug!(%endpoint, "detached browser session");
        Ok(Arc::new(DetachedSession::new(endpoint)))
    }
}

pub struct DetachedSession {
    endpoint: String,
    tabs: Mutex<Vec<Arc<DetachedTab>>>,
}

impl DetachedSession {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tabs: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open_tabs(&self) -> Vec<Arc<DetachedTab>> {
        self.tabs
            .lock()
            .map(|tabs| tabs.iter().filter(|tab| !tab.is_closed()).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrowserSession for DetachedSession {
    async fn new_tab(&self) -> Result<Arc<dyn BrowserTab>> {
        let tab = Arc::new(DetachedTab::new(TargetId::generate()));
        let mut tabs = self
            .tabs
            .lock()
            .map_err(|_| Error::browser("tab registry poisoned"))?;
        tabs.retain(|tab| !tab.is_closed());
        tabs.push(tab.clone());
        Ok(tab)
    }

    fn tabs(&self) -> Vec<Arc<dyn BrowserTab>> {
        self.open_tabs()
            .into_iter()
            .map(|tab| tab as Arc<dyn BrowserTab>)
            .collect()
    }

    async fn close_all_tabs(&self) -> Result<()> {
        for tab in self.open_tabs() {
            tab.close().await?;
        }
        if let Ok(mut tabs) = self.tabs.lock() {
            tabs.clear();
        }
        Ok(())
    }
}

pub struct DetachedTab {
    target_id: TargetId,
    closed: AtomicBool,
}

impl DetachedTab {
    pub fn new(target_id: TargetId) -> Self {
        Self {
            target_id,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrowserTab for DetachedTab {
    fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn current_url(&self) -> Option<String> {
        None
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
