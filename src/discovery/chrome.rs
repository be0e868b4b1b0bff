//! Headless Chrome 表单页面
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 为阻塞 API，所有页面操作都放进 spawn_blocking；元素句柄按 (选择器, 序号)
//! 每次重新查找，避免持有跨调用的 DOM 引用。

#![cfg(feature = "browser")]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use headless_chrome::{Browser, Element, Tab};

use super::surface::{ElementHandle, FormSurface, SurfaceFactory};
use crate::core::SurfaceError;

const VISIBLE_JS: &str = "function() { \
    const r = this.getBoundingClientRect(); \
    const s = window.getComputedStyle(this); \
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none'; }";

const SET_VALUE_JS: &str = "function(v) { \
    this.focus(); this.value = v; \
    this.dispatchEvent(new Event('input', { bubbles: true })); \
    this.dispatchEvent(new Event('change', { bubbles: true })); }";

/// 懒启动浏览器，每次 open 新建一个 Tab
#[derive(Default)]
pub struct ChromeSurfaceFactory {
    browser: Arc<Mutex<Option<Browser>>>,
}

impl ChromeSurfaceFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SurfaceFactory for ChromeSurfaceFactory {
    async fn open(&self, url: &str) -> Result<Box<dyn FormSurface>, SurfaceError> {
        let browser = Arc::clone(&self.browser);
        let url = url.to_string();
        tracing::info!(url = %url, "opening form in headless browser");

        let tab = tokio::task::spawn_blocking(move || {
            let mut guard = browser
                .lock()
                .map_err(|e| SurfaceError::Backend(e.to_string()))?;
            if guard.is_none() {
                let launched =
                    Browser::default().map_err(|e| SurfaceError::Backend(format!("Chrome launch failed: {e}")))?;
                *guard = Some(launched);
            }
            let browser = guard
                .as_ref()
                .ok_or_else(|| SurfaceError::Backend("browser unavailable".into()))?;
            let tab = browser
                .new_tab()
                .map_err(|e| SurfaceError::Backend(format!("Browser tab failed: {e}")))?;
            tab.navigate_to(&url)
                .map_err(|e| SurfaceError::Navigation(e.to_string()))?;
            tab.wait_for_element("body")
                .map_err(|e| SurfaceError::Navigation(format!("Page load failed: {e}")))?;
            Ok::<_, SurfaceError>(tab)
        })
        .await
        .map_err(|e| SurfaceError::Backend(format!("Task join: {e}")))??;

        Ok(Box::new(ChromeSurface { tab }))
    }
}

pub struct ChromeSurface {
    tab: Arc<Tab>,
}

impl ChromeSurface {
    async fn with_element<T, F>(&self, el: &ElementHandle, f: F) -> Result<T, SurfaceError>
    where
        T: Send + 'static,
        F: FnOnce(&Element<'_>) -> Result<T, SurfaceError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let el = el.clone();
        tokio::task::spawn_blocking(move || {
            let elements = tab
                .find_elements(&el.selector)
                .map_err(|e| SurfaceError::Detached(format!("{}: {e}", el.selector)))?;
            let element = elements
                .get(el.index)
                .ok_or_else(|| SurfaceError::Detached(format!("{}[{}]", el.selector, el.index)))?;
            f(element)
        })
        .await
        .map_err(|e| SurfaceError::Backend(format!("Task join: {e}")))?
    }
}

fn backend(e: impl std::fmt::Display) -> SurfaceError {
    SurfaceError::Backend(e.to_string())
}

#[async_trait]
impl FormSurface for ChromeSurface {
    async fn locate(&self, selector: &str) -> Result<Vec<ElementHandle>, SurfaceError> {
        let tab = Arc::clone(&self.tab);
        let selector = selector.to_string();
        tokio::task::spawn_blocking(move || {
            // 无匹配时 headless_chrome 返回错误，这里视为空集
            let count = match tab.find_elements(&selector) {
                Ok(found) => found.len(),
                Err(e) => {
                    tracing::debug!(selector = %selector, error = %e, "no elements matched");
                    0
                }
            };
            (0..count).map(|i| ElementHandle::new(selector.clone(), i)).collect()
        })
        .await
        .map_err(|e| SurfaceError::Backend(format!("Task join: {e}")))
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, SurfaceError> {
        self.with_element(el, |e| {
            let obj = e.call_js_fn(VISIBLE_JS, vec![], false).map_err(backend)?;
            Ok(obj.value.and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .await
    }

    async fn read_text(&self, el: &ElementHandle) -> Result<String, SurfaceError> {
        self.with_element(el, |e| e.get_inner_text().map_err(backend)).await
    }

    async fn attribute(&self, el: &ElementHandle, name: &str) -> Result<Option<String>, SurfaceError> {
        let name = name.to_string();
        self.with_element(el, move |e| e.get_attribute_value(&name).map_err(backend))
            .await
    }

    async fn set_value(&self, el: &ElementHandle, value: &str) -> Result<(), SurfaceError> {
        let value = serde_json::Value::String(value.to_string());
        self.with_element(el, move |e| {
            e.call_js_fn(SET_VALUE_JS, vec![value], false).map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), SurfaceError> {
        self.with_element(el, |e| {
            e.click().map_err(backend)?;
            Ok(())
        })
        .await
    }
}
