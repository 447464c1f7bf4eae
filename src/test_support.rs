//! 测试用的脚本化 HTTP 传输与手动时钟。

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::base_system::rate_limit::Clock;
use crate::network_parser::network::{HttpRequest, HttpResponse, HttpTransport, TransportError};

#[derive(Debug, Clone)]
pub enum Reply {
    Response(HttpResponse),
    Error(TransportError),
    /// 先睡一会儿再给出内层应答，用于取消与并发测试
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn delayed(delay: Duration, inner: impl Into<Reply>) -> Self {
        Reply::Delayed(delay, Box::new(inner.into()))
    }

    fn resolve(self) -> Result<HttpResponse, TransportError> {
        match self {
            Reply::Response(resp) => Ok(resp),
            Reply::Error(err) => Err(err),
            Reply::Delayed(delay, inner) => {
                thread::sleep(delay);
                inner.resolve()
            }
        }
    }
}

impl From<HttpResponse> for Reply {
    fn from(resp: HttpResponse) -> Self {
        Reply::Response(resp)
    }
}

impl From<TransportError> for Reply {
    fn from(err: TransportError) -> Self {
        Reply::Error(err)
    }
}

#[derive(Default)]
struct Script {
    persistent: HashMap<String, Reply>,
    queued: HashMap<String, VecDeque<Reply>>,
    requests: Vec<HttpRequest>,
}

/// 按地址（完全匹配或最长前缀）返回预设应答，未登记的地址返回 404。
///
/// `once` 登记的应答先按顺序消费，耗尽后才落到 `on` 的常驻应答。
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, url_prefix: &str, reply: impl Into<Reply>) {
        let mut script = self.script.lock().unwrap();
        script.persistent.insert(url_prefix.to_string(), reply.into());
    }

    pub fn once(&self, url_prefix: &str, reply: impl Into<Reply>) {
        let mut script = self.script.lock().unwrap();
        script
            .queued
            .entry(url_prefix.to_string())
            .or_default()
            .push_back(reply.into());
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    pub fn image(bytes: Vec<u8>) -> HttpResponse {
        HttpResponse::new(200, bytes).with_header("Content-Type", "image/png")
    }

    pub fn status(code: u16) -> HttpResponse {
        HttpResponse::new(code, Vec::new())
    }

    pub fn html(body: &str) -> HttpResponse {
        HttpResponse::new(200, body.as_bytes().to_vec())
            .with_header("Content-Type", "text/html; charset=utf-8")
    }

    pub fn json(value: Value) -> HttpResponse {
        HttpResponse::new(200, value.to_string().into_bytes())
            .with_header("Content-Type", "application/json")
    }

    fn best_key<'a>(keys: impl Iterator<Item = &'a String>, url: &str) -> Option<String> {
        keys.filter(|k| url == k.as_str() || url.starts_with(k.as_str()))
            .max_by_key(|k| k.len())
            .cloned()
    }

    fn next_reply(&self, request: &HttpRequest) -> Reply {
        let mut script = self.script.lock().unwrap();
        script.requests.push(request.clone());

        let queued_keys = script
            .queued
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, _)| k);
        if let Some(key) = Self::best_key(queued_keys, &request.url)
            && let Some(reply) = script.queued.get_mut(&key).and_then(VecDeque::pop_front)
        {
            return reply;
        }
        match Self::best_key(script.persistent.keys(), &request.url) {
            Some(key) => script.persistent[&key].clone(),
            None => Reply::Response(Self::status(404)),
        }
    }
}

impl HttpTransport for MockTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        // 锁在这里已经释放，延迟应答不会阻塞其他线程
        self.next_reply(request).resolve()
    }
}

/// 生成指定尺寸的真实 PNG。
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(width, height);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// 只在 `advance`/`sleep` 时前进的时钟。
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
