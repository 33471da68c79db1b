//! Heuristic element location.
//!
//! Every role owns an ordered list of [`Rule`]s. The first rule that matches
//! anything on the page wins and its first match in document order is
//! returned. There is no scoring across rules.

use std::fmt;

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SelectorConfig;
use crate::{Error, Result};

/// What an element is needed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Username,
    Password,
    Submit,
    DataLink,
    YearSelect,
    MonthSelect,
    FilterSubmit,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Username => "username",
            Role::Password => "password",
            Role::Submit => "submit",
            Role::DataLink => "data link",
            Role::YearSelect => "year select",
            Role::MonthSelect => "month select",
            Role::FilterSubmit => "filter submit",
        };
        f.write_str(name)
    }
}

/// One structural candidate.
///
/// String form, as used in config files:
/// - `input[name*="user"]` (or `css:...`): a CSS selector.
/// - `link:Data`: an `<a>` whose visible text contains `Data`.
/// - `attr:select:name,id:year`: a `<select>` whose `name` or `id`
///   contains `year`, ignoring case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rule {
    Css(String),
    LinkText(String),
    AttrKeyword {
        tag: String,
        attrs: Vec<String>,
        keyword: String,
    },
}

impl TryFrom<String> for Rule {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if let Some(text) = value.strip_prefix("link:") {
            return Ok(Rule::LinkText(text.into()));
        }
        if let Some(rest) = value.strip_prefix("attr:") {
            let mut parts = rest.splitn(3, ':');
            return match (parts.next(), parts.next(), parts.next()) {
                (Some(tag), Some(attrs), Some(keyword)) if !tag.is_empty() => {
                    Ok(Rule::AttrKeyword {
                        tag: tag.into(),
                        attrs: attrs.split(',').map(|a| a.trim().to_string()).collect(),
                        keyword: keyword.into(),
                    })
                }
                _ => Err(format!("malformed attr rule: {value}")),
            };
        }
        let css = value.strip_prefix("css:").unwrap_or(&value);
        Ok(Rule::Css(css.into()))
    }
}

impl From<Rule> for String {
    fn from(rule: Rule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Css(css) => f.write_str(css),
            Rule::LinkText(text) => write!(f, "link:{text}"),
            Rule::AttrKeyword { tag, attrs, keyword } => {
                write!(f, "attr:{tag}:{}:{keyword}", attrs.join(","))
            }
        }
    }
}

/// Anything that can pick the first structurally matching element of a page.
pub trait StructuralMatch {
    fn first_match<'a>(&self, page: &'a Html) -> Option<ElementRef<'a>>;
}

/// A [`Rule`] compiled against the HTML engine.
#[derive(Debug, Clone)]
pub enum Matcher {
    Css(Selector),
    LinkText { anchors: Selector, text: String },
    AttrKeyword {
        tag: Selector,
        attrs: Vec<String>,
        keyword: String,
    },
}

impl Matcher {
    pub fn compile(rule: &Rule) -> Result<Self> {
        Ok(match rule {
            Rule::Css(css) => Matcher::Css(create_selector(css)?),
            Rule::LinkText(text) => Matcher::LinkText {
                anchors: create_selector("a")?,
                text: text.clone(),
            },
            Rule::AttrKeyword { tag, attrs, keyword } => Matcher::AttrKeyword {
                tag: create_selector(tag)?,
                attrs: attrs.clone(),
                keyword: keyword.to_lowercase(),
            },
        })
    }
}

impl StructuralMatch for Matcher {
    fn first_match<'a>(&self, page: &'a Html) -> Option<ElementRef<'a>> {
        match self {
            Matcher::Css(selector) => page.select(selector).next(),
            Matcher::LinkText { anchors, text } => page
                .select(anchors)
                .find(|a| visible_text(a).contains(text.as_str())),
            Matcher::AttrKeyword { tag, attrs, keyword } => page.select(tag).find(|el| {
                attrs.iter().any(|attr| {
                    el.value()
                        .attr(attr)
                        .is_some_and(|v| v.to_lowercase().contains(keyword.as_str()))
                })
            }),
        }
    }
}

#[inline]
pub(crate) fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::InvalidSelector(sel_str.into()))
}

/// Text content with whitespace runs collapsed, roughly what a browser renders.
pub fn visible_text(el: &ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    TextInput,
    PasswordInput,
    SubmitControl,
    Select,
    Link,
    Other,
}

/// Snapshot of one element's identifying attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormElementDescriptor {
    pub kind: ElementKind,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    /// Placeholder, or visible text for buttons and links.
    pub label: Option<String>,
    pub value: Option<String>,
    pub href: Option<String>,
    /// `(value, label)` pairs, selects only.
    pub options: Vec<(String, String)>,
}

impl FormElementDescriptor {
    pub fn describe(el: &ElementRef) -> Self {
        let attr = |name: &str| el.value().attr(name).map(str::to_string);
        let tag = el.value().name();
        let input_type = attr("type").map(|t| t.to_lowercase());
        let text = visible_text(el);

        let kind = match (tag, input_type.as_deref()) {
            ("input", Some("password")) => ElementKind::PasswordInput,
            ("input", Some("submit" | "button" | "image")) | ("button", _) => {
                ElementKind::SubmitControl
            }
            ("input", Some("hidden" | "checkbox" | "radio" | "file")) => ElementKind::Other,
            ("input", _) | ("textarea", _) => ElementKind::TextInput,
            ("select", _) => ElementKind::Select,
            ("a", _) => ElementKind::Link,
            _ => ElementKind::Other,
        };

        let label = match kind {
            ElementKind::SubmitControl | ElementKind::Link if !text.is_empty() => Some(text),
            _ => attr("placeholder"),
        };

        let options = if kind == ElementKind::Select {
            select_options(el)
        } else {
            Vec::new()
        };

        Self {
            kind,
            name: attr("name"),
            id: attr("id"),
            class: attr("class"),
            label,
            value: attr("value"),
            href: attr("href"),
            options,
        }
    }
}

fn select_options(el: &ElementRef) -> Vec<(String, String)> {
    let Ok(option_sel) = create_selector("option") else {
        return Vec::new();
    };
    el.select(&option_sel)
        .map(|opt| {
            let text = visible_text(&opt);
            let value = opt.value().attr("value").map_or_else(|| text.clone(), str::to_string);
            (value, text)
        })
        .collect()
}

/// Points at a live element as "the `index`-th `tag` in document order".
#[derive(Debug, Clone, PartialEq)]
pub struct ElementHandle {
    pub role: Role,
    pub tag: String,
    pub index: usize,
    pub descriptor: FormElementDescriptor,
}

impl ElementHandle {
    fn from_match(role: Role, page: &Html, el: ElementRef) -> Option<Self> {
        let tag = el.value().name().to_string();
        let same_tag = create_selector(&tag).ok()?;
        let index = page.select(&same_tag).position(|other| other.id() == el.id())?;
        Some(Self {
            role,
            tag,
            index,
            descriptor: FormElementDescriptor::describe(&el),
        })
    }
}

/// Compiled candidate lists for every role.
#[derive(Debug, Clone)]
pub struct Locator {
    username: Vec<(Rule, Matcher)>,
    password: Vec<(Rule, Matcher)>,
    submit: Vec<(Rule, Matcher)>,
    data_link: Vec<(Rule, Matcher)>,
    year_select: Vec<(Rule, Matcher)>,
    month_select: Vec<(Rule, Matcher)>,
    filter_submit: Vec<(Rule, Matcher)>,
}

fn compile_all(rules: &[Rule]) -> Result<Vec<(Rule, Matcher)>> {
    rules
        .iter()
        .map(|rule| Ok((rule.clone(), Matcher::compile(rule)?)))
        .collect()
}

impl Locator {
    pub fn new(selectors: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            username: compile_all(&selectors.username)?,
            password: compile_all(&selectors.password)?,
            submit: compile_all(&selectors.submit)?,
            data_link: compile_all(&selectors.data_link)?,
            year_select: compile_all(&selectors.year_select)?,
            month_select: compile_all(&selectors.month_select)?,
            filter_submit: compile_all(&selectors.filter_submit)?,
        })
    }

    fn candidates(&self, role: Role) -> &[(Rule, Matcher)] {
        match role {
            Role::Username => &self.username,
            Role::Password => &self.password,
            Role::Submit => &self.submit,
            Role::DataLink => &self.data_link,
            Role::YearSelect => &self.year_select,
            Role::MonthSelect => &self.month_select,
            Role::FilterSubmit => &self.filter_submit,
        }
    }

    /// First element matched by the first rule that matches anything.
    /// `None` is a normal outcome, the caller decides if it is fatal.
    pub fn locate(&self, role: Role, page: &Html) -> Option<ElementHandle> {
        for (rule, matcher) in self.candidates(role) {
            if let Some(el) = matcher.first_match(page) {
                info!(%role, %rule, "found element");
                return ElementHandle::from_match(role, page, el);
            }
        }
        debug!(%role, "no candidate matched");
        None
    }

    /// Like [`Locator::locate`] but a miss is an [`Error::NotFound`].
    pub fn require(&self, role: Role, page: &Html) -> Result<ElementHandle> {
        self.locate(role, page).ok_or(Error::NotFound(role))
    }
}

/// ASP.NET hidden state carried between postbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormTokens {
    pub view_state: Option<String>,
    pub event_validation: Option<String>,
}

impl FormTokens {
    pub fn read(page: &Html) -> Self {
        let hidden = |name: &str| {
            let sel = create_selector(&format!(r#"input[name="{name}"]"#)).ok()?;
            page.select(&sel)
                .next()
                .and_then(|el| el.value().attr("value"))
                .map(str::to_string)
        };
        Self {
            view_state: hidden("__VIEWSTATE"),
            event_validation: hidden("__EVENTVALIDATION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputInfo {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    pub value: Option<String>,
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectInfo {
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    pub options: Vec<SelectOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ButtonInfo {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormInfo {
    pub action: Option<String>,
    pub method: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
}

/// Every input, select, button and form on a page, for the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormInventory {
    pub inputs: Vec<InputInfo>,
    pub selects: Vec<SelectInfo>,
    pub buttons: Vec<ButtonInfo>,
    pub forms: Vec<FormInfo>,
}

impl FormInventory {
    pub fn collect(page: &Html) -> Result<Self> {
        let attr = |el: &ElementRef, name: &str| el.value().attr(name).map(str::to_string);

        let inputs = page
            .select(&create_selector("input")?)
            .map(|el| InputInfo {
                kind: attr(&el, "type"),
                name: attr(&el, "name"),
                id: attr(&el, "id"),
                class: attr(&el, "class"),
                value: attr(&el, "value"),
                placeholder: attr(&el, "placeholder"),
            })
            .collect();

        let selects = page
            .select(&create_selector("select")?)
            .map(|el| SelectInfo {
                name: attr(&el, "name"),
                id: attr(&el, "id"),
                class: attr(&el, "class"),
                options: select_options(&el)
                    .into_iter()
                    .map(|(value, text)| SelectOption { value, text })
                    .collect(),
            })
            .collect();

        let buttons = page
            .select(&create_selector("button")?)
            .map(|el| ButtonInfo {
                kind: attr(&el, "type"),
                name: attr(&el, "name"),
                id: attr(&el, "id"),
                class: attr(&el, "class"),
                text: visible_text(&el),
            })
            .collect();

        let forms = page
            .select(&create_selector("form")?)
            .map(|el| FormInfo {
                action: attr(&el, "action"),
                method: attr(&el, "method"),
                name: attr(&el, "name"),
                id: attr(&el, "id"),
                class: attr(&el, "class"),
            })
            .collect();

        Ok(Self {
            inputs,
            selects,
            buttons,
            forms,
        })
    }

    /// Dumps the login-relevant part of the inventory to the log.
    pub fn log_login_controls(&self, page: &Html) -> Result<()> {
        info!("found {} input fields", self.inputs.len());
        for (i, input) in self.inputs.iter().enumerate() {
            info!(
                "field {i}: type={:?}, name={:?}, id={:?}, value={:?}",
                input.kind, input.name, input.id, input.value
            );
        }

        let button_sel = create_selector("button")?;
        let submit_sel = create_selector(r#"input[type="submit"]"#)?;
        let buttons: Vec<_> = page
            .select(&button_sel)
            .chain(page.select(&submit_sel))
            .collect();
        info!("found {} buttons", buttons.len());
        for (i, button) in buttons.iter().enumerate() {
            let text = visible_text(button);
            let text = if text.is_empty() {
                button.value().attr("value").unwrap_or_default().to_string()
            } else {
                text
            };
            info!(
                "button {i}: text={text}, name={:?}, id={:?}",
                button.value().attr("name"),
                button.value().attr("id")
            );
        }
        Ok(())
    }
}

/// `(text, href)` of every non-empty link, for navigation troubleshooting.
pub fn links(page: &Html) -> Result<Vec<(String, Option<String>)>> {
    Ok(page
        .select(&create_selector("a")?)
        .map(|a| (visible_text(&a), a.value().attr("href").map(str::to_string)))
        .filter(|(text, _)| !text.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
        <html><body>
          <form action="/Login.aspx" method="post">
            <input type="hidden" name="__VIEWSTATE" value="vs123" />
            <input type="hidden" name="__EVENTVALIDATION" value="ev456" />
            <input type="text" name="txtSearch" />
            <input type="text" name="ctl00$UserId" id="UserId" placeholder="ID" />
            <input type="password" name="ctl00$Pwd" />
            <input type="submit" value="ログイン" name="btnLogin" />
          </form>
        </body></html>
    "#;

    fn locator() -> Locator {
        Locator::new(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn username_rule_order_beats_document_order() {
        let page = Html::parse_document(LOGIN_PAGE);
        let handle = locator().locate(Role::Username, &page).unwrap();
        // `input[type="text"]` would have matched txtSearch first, but it is the last rule.
        assert_eq!(handle.descriptor.name.as_deref(), Some("ctl00$UserId"));
        assert_eq!(handle.tag, "input");
        assert_eq!(handle.index, 3);
        assert_eq!(handle.descriptor.kind, ElementKind::TextInput);
        assert_eq!(handle.descriptor.label.as_deref(), Some("ID"));
    }

    #[test]
    fn password_falls_through_to_type_rule() {
        let page = Html::parse_document(LOGIN_PAGE);
        let handle = locator().locate(Role::Password, &page).unwrap();
        assert_eq!(handle.index, 4);
        assert_eq!(handle.descriptor.kind, ElementKind::PasswordInput);
    }

    #[test]
    fn submit_control_found() {
        let page = Html::parse_document(LOGIN_PAGE);
        let handle = locator().locate(Role::Submit, &page).unwrap();
        assert_eq!(handle.descriptor.kind, ElementKind::SubmitControl);
        assert_eq!(handle.descriptor.value.as_deref(), Some("ログイン"));
    }

    #[test]
    fn missing_role_is_none_not_error() {
        let page = Html::parse_document("<html><body><p>maintenance</p></body></html>");
        assert!(locator().locate(Role::Password, &page).is_none());
        assert!(matches!(
            locator().require(Role::Password, &page),
            Err(Error::NotFound(Role::Password))
        ));
    }

    #[test]
    fn link_keywords_follow_list_order() {
        let page = Html::parse_document(
            r#"<a href="/history">履歴</a><a href="/top">トップ</a><a href="/bg">血糖値一覧</a>"#,
        );
        let handle = locator().locate(Role::DataLink, &page).unwrap();
        assert_eq!(handle.descriptor.href.as_deref(), Some("/bg"));
        assert_eq!(handle.index, 2);
        assert_eq!(handle.descriptor.kind, ElementKind::Link);
    }

    #[test]
    fn select_keywords_ignore_case() {
        let page = Html::parse_document(
            r#"<select name="ddlMonth"><option value="1">1月</option></select>
               <select id="DDL_YEAR"><option value="2024">2024年</option><option>2023</option></select>"#,
        );
        let year = locator().locate(Role::YearSelect, &page).unwrap();
        assert_eq!(year.index, 1);
        assert_eq!(
            year.descriptor.options,
            vec![
                ("2024".to_string(), "2024年".to_string()),
                ("2023".to_string(), "2023".to_string())
            ]
        );
        let month = locator().locate(Role::MonthSelect, &page).unwrap();
        assert_eq!(month.index, 0);
    }

    #[test]
    fn filter_submit_by_value_keyword() {
        let page = Html::parse_document(
            r#"<input type="button" value="戻る" /><input type="submit" value="表示する" />"#,
        );
        let handle = locator().locate(Role::FilterSubmit, &page).unwrap();
        assert_eq!(handle.index, 1);
    }

    #[test]
    fn rule_string_forms() {
        let rule = Rule::try_from("attr:select:name, id:year".to_string()).unwrap();
        assert_eq!(
            rule,
            Rule::AttrKeyword {
                tag: "select".into(),
                attrs: vec!["name".into(), "id".into()],
                keyword: "year".into()
            }
        );
        assert_eq!(rule.to_string(), "attr:select:name,id:year");
        assert_eq!(
            Rule::try_from("link:Data".to_string()),
            Ok(Rule::LinkText("Data".into()))
        );
        assert_eq!(
            Rule::try_from(r#"css:input[type="text"]"#.to_string()),
            Ok(Rule::Css(r#"input[type="text"]"#.into()))
        );
        assert!(Rule::try_from("attr:select".to_string()).is_err());
    }

    #[test]
    fn invalid_css_rejected_at_compile() {
        let mut selectors = SelectorConfig::default();
        selectors.submit.push(Rule::Css("input[".into()));
        assert!(matches!(
            Locator::new(&selectors),
            Err(Error::InvalidSelector(_))
        ));
    }

    #[test]
    fn tokens_and_inventory() {
        let page = Html::parse_document(LOGIN_PAGE);
        let tokens = FormTokens::read(&page);
        assert_eq!(tokens.view_state.as_deref(), Some("vs123"));
        assert_eq!(tokens.event_validation.as_deref(), Some("ev456"));

        let inventory = FormInventory::collect(&page).unwrap();
        assert_eq!(inventory.inputs.len(), 6);
        assert_eq!(inventory.forms[0].method.as_deref(), Some("post"));
        assert!(inventory.buttons.is_empty());
    }
}
