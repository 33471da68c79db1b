#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use glucose_scrap::config::Settings;
use glucose_scrap::driver::PageDriver;
use glucose_scrap::locate::ElementHandle;
use glucose_scrap::{Error, Result};
use scraper::{Html, Selector};

pub const BASE_URL: &str = "https://portal.test/";

pub const LOGIN_PAGE: &str = r#"
<html><head><title>ログイン</title></head><body>
  <form method="post" action="./">
    <input type="hidden" name="__VIEWSTATE" value="login-vs" />
    <input type="text" name="txtUserId" id="txtUserId" />
    <input type="password" name="txtPassword" id="txtPassword" />
    <input type="submit" name="btnLogin" value="ログイン" />
  </form>
</body></html>"#;

pub const MENU_PAGE: &str = r#"
<html><head><title>メニュー</title></head><body>
  <a href="https://portal.test/Profile.aspx">プロフィール</a>
  <a href="https://portal.test/Glucose.aspx">血糖値データ</a>
</body></html>"#;

pub const DATA_PAGE: &str = r#"
<html><head><title>血糖値一覧</title></head><body>
  <form>
    <input type="hidden" name="__VIEWSTATE" value="data-vs" />
    <input type="hidden" name="__EVENTVALIDATION" value="data-ev" />
    <select name="ddlYear"><option value="2023">2023年</option><option value="2024">2024年</option></select>
    <select name="ddlMonth"><option value="02">2</option><option value="03">3</option></select>
    <input type="submit" value="表示" />
  </form>
  <table class="layout"><tr><td>お知らせ</td></tr><tr><td>なし</td></tr></table>
  <table id="gvData">
    <tr><th>No</th><th>測定日時</th><th>血糖値</th><th>メモ</th></tr>
    <tr><td>1</td><td>2024/03/01 08:30</td><td>120 mg/dL</td><td>朝食前</td></tr>
    <tr><td>2</td><td>2024/03/01 12:10</td><td>--</td><td>未測定</td></tr>
    <tr><td>3</td><td>3/2 夕</td><td>98.5</td><td></td></tr>
    <tr><td>4</td></tr>
  </table>
</body></html>"#;

#[derive(Default)]
struct State {
    pages: HashMap<String, String>,
    current: String,
    submit_targets: HashMap<String, String>,
    typed: Vec<(String, String)>,
    selected: Vec<(String, String)>,
    clicked: Vec<String>,
    entered: bool,
}

/// In-memory browser: pages by URL, links navigate, submits follow `on_submit`.
pub struct FakeDriver {
    state: Mutex<State>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .pages
            .insert(url.to_string(), html.to_string());
        self
    }

    /// Submitting a form on `from` lands on `to`; elsewhere it reloads in place.
    pub fn on_submit(self, from: &str, to: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .submit_targets
            .insert(from.to_string(), to.to_string());
        self
    }

    pub fn portal() -> Self {
        FakeDriver::new()
            .page(BASE_URL, LOGIN_PAGE)
            .page("https://portal.test/Menu.aspx", MENU_PAGE)
            .page("https://portal.test/Glucose.aspx", DATA_PAGE)
            .on_submit(BASE_URL, "https://portal.test/Menu.aspx")
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().typed.clone()
    }

    pub fn selected(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().selected.clone()
    }

    pub fn clicked(&self) -> Vec<String> {
        self.state.lock().unwrap().clicked.clone()
    }

    pub fn entered(&self) -> bool {
        self.state.lock().unwrap().entered
    }

    fn current_html(&self) -> String {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&state.current)
            .cloned()
            .unwrap_or_else(|| "<html><body></body></html>".to_string())
    }

    /// `(name-or-id, href, option values and labels)` of the handle's element.
    fn inspect(&self, el: &ElementHandle) -> Result<(String, Option<String>, Vec<(String, String)>)> {
        let doc = Html::parse_document(&self.current_html());
        let sel = Selector::parse(&el.tag).unwrap();
        let option = Selector::parse("option").unwrap();
        let node = doc.select(&sel).nth(el.index).ok_or(Error::StaleElement {
            tag: el.tag.clone(),
            index: el.index,
        })?;
        let name = node
            .value()
            .attr("name")
            .or(node.value().attr("id"))
            .unwrap_or_default()
            .to_string();
        let href = node.value().attr("href").map(str::to_string);
        let options = node
            .select(&option)
            .map(|o| {
                let text = o.text().collect::<String>();
                (o.value().attr("value").map_or(text.clone(), str::to_string), text)
            })
            .collect();
        Ok((name, href, options))
    }

    fn navigate(&self, url: &str) {
        self.state.lock().unwrap().current = url.to_string();
    }

    fn submit(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(target) = state.submit_targets.get(&state.current).cloned() {
            state.current = target;
        }
    }
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn goto(&self, url: &str) -> Result<()> {
        self.navigate(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().current.clone())
    }

    async fn title(&self) -> Result<String> {
        Ok("fake".to_string())
    }

    async fn source(&self) -> Result<String> {
        Ok(self.current_html())
    }

    async fn ready_state(&self) -> Result<String> {
        Ok("complete".to_string())
    }

    async fn click(&self, el: &ElementHandle) -> Result<()> {
        let (name, href, _) = self.inspect(el)?;
        self.state.lock().unwrap().clicked.push(name);
        match href {
            Some(href) => self.navigate(&href),
            None => self.submit(),
        }
        Ok(())
    }

    async fn clear(&self, el: &ElementHandle) -> Result<()> {
        self.inspect(el).map(|_| ())
    }

    async fn type_text(&self, el: &ElementHandle, text: &str) -> Result<()> {
        let (name, _, _) = self.inspect(el)?;
        self.state.lock().unwrap().typed.push((name, text.to_string()));
        Ok(())
    }

    async fn press_enter(&self, el: &ElementHandle) -> Result<()> {
        self.inspect(el)?;
        self.state.lock().unwrap().entered = true;
        self.submit();
        Ok(())
    }

    async fn select_by_value(&self, el: &ElementHandle, value: &str) -> Result<()> {
        let (name, _, options) = self.inspect(el)?;
        if !options.iter().any(|(v, _)| v == value) {
            return Err(Error::NotFound(el.role));
        }
        self.state.lock().unwrap().selected.push((name, format!("value:{value}")));
        Ok(())
    }

    async fn select_by_label(&self, el: &ElementHandle, label: &str) -> Result<()> {
        let (name, _, options) = self.inspect(el)?;
        if !options.iter().any(|(_, l)| l == label) {
            return Err(Error::NotFound(el.role));
        }
        self.state.lock().unwrap().selected.push((name, format!("label:{label}")));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Defaults with no waiting, writing under `dir`.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.base_url = BASE_URL.to_string();
    settings.browser.implicit_wait_secs = 0;
    settings.browser.settle_millis = 0;
    settings.browser.ready_timeout_secs = 1;
    settings.retry.delay_secs = 0;
    settings.output.data_dir = dir.join("data");
    settings.output.backup_dir = dir.join("data/backup");
    settings.output.screenshot_dir = dir.join("screenshots");
    settings.output.page_source_dir = dir.join("page_sources");
    settings
}
