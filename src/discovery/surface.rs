//! 表单页面抽象
//!
//! 探测循环只需要这几个原语：按选择器定位、可见性、读文本 / 属性、设值、点击。
//! 浏览器实现见 chrome.rs（feature "browser"）；测试使用内存假页面。

use async_trait::async_trait;

use crate::core::SurfaceError;

/// 页面元素的不透明引用：选择器 + 匹配序号
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub selector: String,
    pub index: usize,
}

impl ElementHandle {
    pub fn new(selector: impl Into<String>, index: usize) -> Self {
        Self {
            selector: selector.into(),
            index,
        }
    }
}

#[async_trait]
pub trait FormSurface: Send + Sync {
    async fn locate(&self, selector: &str) -> Result<Vec<ElementHandle>, SurfaceError>;
    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, SurfaceError>;
    async fn read_text(&self, el: &ElementHandle) -> Result<String, SurfaceError>;
    async fn attribute(&self, el: &ElementHandle, name: &str) -> Result<Option<String>, SurfaceError>;
    async fn set_value(&self, el: &ElementHandle, value: &str) -> Result<(), SurfaceError>;
    async fn click(&self, el: &ElementHandle) -> Result<(), SurfaceError>;
}

/// 打开指定 URL 的表单页面
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn FormSurface>, SurfaceError>;
}
