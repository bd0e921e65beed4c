use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};

use crate::{
    dom,
    extension_bridge::{ExtensionBridge, PeerSignal},
    AutomationError, Page, PageProvider,
};

/// A [`Page`] driven through the extension bridge: every operation is a script
/// evaluated in the tab the extension is attached to.
pub struct BridgePage {
    bridge: Arc<ExtensionBridge>,
    eval_timeout: Duration,
    navigation_timeout: Duration,
    closed: AtomicBool,
}

impl BridgePage {
    pub fn new(bridge: Arc<ExtensionBridge>, eval_timeout: Duration) -> Self {
        Self {
            bridge,
            eval_timeout,
            navigation_timeout: Duration::from_secs(10),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    pub fn bridge(&self) -> &Arc<ExtensionBridge> {
        &self.bridge
    }

    fn ensure_open(&self) -> Result<(), AutomationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AutomationError::BridgeUnavailable("page is closed".into()));
        }
        Ok(())
    }

    async fn run(&self, selector: &str, script: String) -> Result<Value, AutomationError> {
        self.ensure_open()?;
        let result = self.bridge.eval(&script, self.eval_timeout).await?;
        dom::interpret(selector, result)
    }
}

#[async_trait]
impl Page for BridgePage {
    async fn url(&self) -> Result<String, AutomationError> {
        let value = self.run("", dom::current_url().to_string()).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AutomationError::PageError("location.href was not a string".into()))
    }

    #[instrument(skip(self))]
    async fn goto(&self, url: &str) -> Result<(), AutomationError> {
        self.ensure_open()?;
        let mut signals = self.bridge.subscribe();
        // The document unloads while answering, so a missing reply is expected.
        if let Err(e) = self.bridge.eval(&dom::navigate(url), self.eval_timeout).await {
            debug!(error = %e, "navigation eval did not answer cleanly");
        }
        let wait = async {
            loop {
                match signals.recv().await {
                    Ok(PeerSignal::PageLoaded { url: loaded }) => return Ok(loaded),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Page signal stream lagged, skipped {} signals", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        return Err(AutomationError::BridgeUnavailable(
                            "bridge closed during navigation".into(),
                        ))
                    }
                }
            }
        };
        match tokio::time::timeout(self.navigation_timeout, wait).await {
            Ok(Ok(loaded)) => {
                debug!(loaded = %loaded, "navigation finished");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AutomationError::Timeout(format!(
                "navigation to {url} did not finish within {}ms",
                self.navigation_timeout.as_millis()
            ))),
        }
    }

    async fn element_tag(&self, selector: &str) -> Result<Option<String>, AutomationError> {
        match self.run(selector, dom::element_tag(selector)).await {
            Ok(value) => Ok(value.as_str().map(str::to_string)),
            Err(AutomationError::SelectorNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn click(&self, selector: &str, force: bool) -> Result<(), AutomationError> {
        self.run(selector, dom::click(selector, force)).await.map(|_| ())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), AutomationError> {
        self.run(selector, dom::fill(selector, text)).await.map(|_| ())
    }

    async fn select_option_by_text(
        &self,
        selector: &str,
        text: &str,
    ) -> Result<(), AutomationError> {
        self.run(selector, dom::select_option_by_text(selector, text))
            .await
            .map(|_| ())
    }

    async fn press(&self, selector: &str, key: &str) -> Result<(), AutomationError> {
        self.run(selector, dom::press(selector, key)).await.map(|_| ())
    }

    async fn scroll_by(&self, delta_x: i64, delta_y: i64) -> Result<(), AutomationError> {
        self.run("window", dom::scroll_by(delta_x, delta_y))
            .await
            .map(|_| ())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AutomationError> {
        self.ensure_open()?;
        self.bridge.eval(script, self.eval_timeout).await
    }

    async fn close(&self) -> Result<(), AutomationError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("bridge page released");
        }
        Ok(())
    }
}

/// Opens [`BridgePage`]s once a browser tab has connected to the bridge.
pub struct BridgePageProvider {
    bridge: Arc<ExtensionBridge>,
    eval_timeout: Duration,
    connect_timeout: Duration,
}

impl BridgePageProvider {
    pub fn new(bridge: Arc<ExtensionBridge>, eval_timeout: Duration) -> Self {
        Self {
            bridge,
            eval_timeout,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn bridge(&self) -> &Arc<ExtensionBridge> {
        &self.bridge
    }
}

#[async_trait]
impl PageProvider for BridgePageProvider {
    async fn open_page(&self) -> Result<Arc<dyn Page>, AutomationError> {
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        while !self.bridge.is_client_connected().await {
            if tokio::time::Instant::now() >= deadline {
                return Err(AutomationError::BridgeUnavailable(format!(
                    "no browser tab connected within {}s",
                    self.connect_timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(Arc::new(BridgePage::new(
            self.bridge.clone(),
            self.eval_timeout,
        )))
    }
}
