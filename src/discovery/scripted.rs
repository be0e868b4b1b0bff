//! 脚本化的内存表单页面（测试与本地演示用）
//!
//! 响应 DiscoveryConfig 默认选择器：输入框、第一个提交按钮、第一个错误选择器、页面 body。
//! 每次提交推进一轮脚本（最后一轮重复）：要么显示一组校验错误，要么显示成功文本。
//! 也可以让第 n 次提交失败，模拟页面崩溃。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::engine::DiscoveryConfig;
use super::surface::{ElementHandle, FormSurface, SurfaceFactory};
use crate::core::SurfaceError;

#[derive(Debug, Clone)]
struct ScriptedInput {
    name: String,
    input_type: String,
    visible: bool,
}

#[derive(Debug, Clone)]
enum Round {
    Errors(Vec<(String, String)>),
    Success(String),
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, String>,
    submits: usize,
}

#[derive(Debug)]
pub struct ScriptedForm {
    inputs: Vec<ScriptedInput>,
    rounds: Vec<Round>,
    has_submit: bool,
    error_attrs: bool,
    crash_on_submit: Option<usize>,
    selectors: DiscoveryConfig,
    state: Mutex<State>,
}

impl Default for ScriptedForm {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            rounds: Vec::new(),
            has_submit: true,
            error_attrs: true,
            crash_on_submit: None,
            selectors: DiscoveryConfig::default(),
            state: Mutex::new(State::default()),
        }
    }
}

impl ScriptedForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, name: &str, input_type: &str) -> Self {
        self.inputs.push(ScriptedInput {
            name: name.to_string(),
            input_type: input_type.to_string(),
            visible: true,
        });
        self
    }

    pub fn hidden_input(mut self, name: &str) -> Self {
        self.inputs.push(ScriptedInput {
            name: name.to_string(),
            input_type: "hidden".to_string(),
            visible: false,
        });
        self
    }

    /// 追加一轮：提交后显示这些 (字段, 提示) 错误
    pub fn errors(self, errors: &[(&str, &str)]) -> Self {
        let owned = errors.iter().map(|(f, m)| (f.to_string(), m.to_string())).collect();
        self.errors_owned(owned)
    }

    pub fn errors_owned(mut self, errors: Vec<(String, String)>) -> Self {
        self.rounds.push(Round::Errors(errors));
        self
    }

    /// 追加一轮：提交后页面显示成功文本
    pub fn success(mut self, text: &str) -> Self {
        self.rounds.push(Round::Success(text.to_string()));
        self
    }

    pub fn without_submit(mut self) -> Self {
        self.has_submit = false;
        self
    }

    /// 错误元素不带 data-field，只能从提示文本推断字段
    pub fn anonymous_errors(mut self) -> Self {
        self.error_attrs = false;
        self
    }

    /// 第 n 次（从 1 开始）点击提交时报错
    pub fn crash_on_submit(mut self, n: usize) -> Self {
        self.crash_on_submit = Some(n);
        self
    }

    /// 自动填充写入的值
    pub fn value(&self, name: &str) -> Option<String> {
        self.lock().values.get(name).cloned()
    }

    pub fn submits(&self) -> usize {
        self.lock().submits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_round(&self) -> Option<&Round> {
        let submits = self.lock().submits;
        if submits == 0 {
            return None;
        }
        self.rounds.get(submits - 1).or_else(|| self.rounds.last())
    }

    fn current_errors(&self) -> Vec<(String, String)> {
        match self.current_round() {
            Some(Round::Errors(errs)) => errs.clone(),
            _ => Vec::new(),
        }
    }

    fn input_at(&self, el: &ElementHandle) -> Result<&ScriptedInput, SurfaceError> {
        self.inputs
            .get(el.index)
            .ok_or_else(|| SurfaceError::Detached(format!("{}[{}]", el.selector, el.index)))
    }

    fn kind(&self, selector: &str) -> Kind {
        let s = &self.selectors;
        if selector == s.input_selector {
            Kind::Input
        } else if s.submit_selectors.first().is_some_and(|x| x == selector) {
            Kind::Submit
        } else if s.error_selectors.first().is_some_and(|x| x == selector) {
            Kind::Error
        } else if selector == s.page_selector {
            Kind::Page
        } else {
            Kind::None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Input,
    Submit,
    Error,
    Page,
    None,
}

#[async_trait]
impl FormSurface for ScriptedForm {
    async fn locate(&self, selector: &str) -> Result<Vec<ElementHandle>, SurfaceError> {
        let count = match self.kind(selector) {
            Kind::Input => self.inputs.len(),
            Kind::Submit => usize::from(self.has_submit),
            Kind::Error => self.current_errors().len(),
            Kind::Page => 1,
            Kind::None => 0,
        };
        Ok((0..count).map(|i| ElementHandle::new(selector, i)).collect())
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, SurfaceError> {
        match self.kind(&el.selector) {
            Kind::Input => Ok(self.input_at(el)?.visible),
            _ => Ok(true),
        }
    }

    async fn read_text(&self, el: &ElementHandle) -> Result<String, SurfaceError> {
        match self.kind(&el.selector) {
            Kind::Error => Ok(self
                .current_errors()
                .get(el.index)
                .map(|(_, m)| m.clone())
                .unwrap_or_default()),
            Kind::Page => Ok(match self.current_round() {
                Some(Round::Success(text)) => text.clone(),
                Some(Round::Errors(_)) => "Please correct the errors below.".to_string(),
                None => "Registration form".to_string(),
            }),
            Kind::Submit => Ok("Submit".to_string()),
            _ => Ok(String::new()),
        }
    }

    async fn attribute(&self, el: &ElementHandle, name: &str) -> Result<Option<String>, SurfaceError> {
        match self.kind(&el.selector) {
            Kind::Input => {
                let input = self.input_at(el)?;
                Ok(match name {
                    "type" => Some(input.input_type.clone()),
                    "name" | "id" => Some(input.name.clone()),
                    "checked" => self.lock().values.get(&input.name).map(|_| "checked".to_string()),
                    _ => None,
                })
            }
            Kind::Error if self.error_attrs && name == "data-field" => Ok(self
                .current_errors()
                .get(el.index)
                .map(|(f, _)| f.clone())
                .filter(|f| !f.is_empty())),
            _ => Ok(None),
        }
    }

    async fn set_value(&self, el: &ElementHandle, value: &str) -> Result<(), SurfaceError> {
        let name = self.input_at(el)?.name.clone();
        self.lock().values.insert(name, value.to_string());
        Ok(())
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), SurfaceError> {
        match self.kind(&el.selector) {
            Kind::Submit => {
                let mut state = self.lock();
                if self.crash_on_submit == Some(state.submits + 1) {
                    return Err(SurfaceError::Backend("page crashed".to_string()));
                }
                state.submits += 1;
            }
            Kind::Input => {
                let name = self.input_at(el)?.name.clone();
                self.lock().values.insert(name, "on".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

/// 每次 open 都用同一个构造函数生成新的脚本表单
pub struct ScriptedFormFactory {
    build: Box<dyn Fn() -> ScriptedForm + Send + Sync>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedFormFactory {
    pub fn new(build: impl Fn() -> ScriptedForm + Send + Sync + 'static) -> Self {
        Self {
            build: Box::new(build),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// 已打开过的 URL
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SurfaceFactory for ScriptedFormFactory {
    async fn open(&self, url: &str) -> Result<Box<dyn FormSurface>, SurfaceError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(url.to_string());
        }
        Ok(Box::new((self.build)()))
    }
}
