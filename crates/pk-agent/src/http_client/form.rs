//! HTML form scraping
//!
//! Pages are parsed into a DOM with html5ever so that comments, templates
//! and odd attribute quoting are handled the way a browser handles them.

use std::cell::RefCell;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever::Attribute;
use markup5ever_rcdom::{Handle, NodeData, RcDom};

/// A named form control (`input`, `button`, `textarea` or `select`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub name: String,
    /// Lowercased `type` for inputs and buttons, else the tag name
    pub kind: String,
    pub value: String,
    pub checked: bool,
    pub disabled: bool,
}

impl Control {
    /// Whether a browser would send this control when the form is submitted
    /// without clicking it
    fn is_successful(&self) -> bool {
        if self.disabled {
            return false;
        }
        match self.kind.as_str() {
            "submit" | "button" | "image" | "reset" | "file" => false,
            "checkbox" | "radio" => self.checked,
            _ => true,
        }
    }

    fn is_submitter(&self) -> bool {
        !self.disabled && matches!(self.kind.as_str(), "submit" | "image")
    }
}

/// A `<form>` element and its controls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    /// Raw `action` attribute, if any
    pub action: Option<String>,
    /// Lowercased `method`, `get` when absent
    pub method: String,
    pub controls: Vec<Control>,
}

impl Form {
    /// Whether the form has controls with every name in `names`
    pub fn has_fields(&self, names: &[&str]) -> bool {
        names
            .iter()
            .all(|name| self.controls.iter().any(|c| c.name == *name))
    }

    /// Whether every control in `names` is visible rather than hidden
    fn shows_fields(&self, names: &[&str]) -> bool {
        names.iter().all(|name| {
            self.controls
                .iter()
                .any(|c| c.name == *name && c.kind != "hidden")
        })
    }

    /// Name/value pairs a browser would submit after the user typed `fields`
    ///
    /// Hidden and pre-filled controls are carried over, supplied values
    /// replace them, and the first submit control counts as the one clicked.
    pub fn submission(&self, fields: &[(String, String)]) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .controls
            .iter()
            .filter(|c| c.is_successful())
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect();

        if let Some(button) = self.controls.iter().find(|c| c.is_submitter()) {
            if button.kind == "image" {
                pairs.push((format!("{}.x", button.name), "0".to_string()));
                pairs.push((format!("{}.y", button.name), "0".to_string()));
            } else {
                pairs.push((button.name.clone(), button.value.clone()));
            }
        }

        for (name, value) in fields {
            match pairs.iter_mut().find(|(n, _)| n == name) {
                Some(pair) => pair.1 = value.clone(),
                None => pairs.push((name.clone(), value.clone())),
            }
        }

        pairs
    }
}

fn parse(html: &str) -> RcDom {
    parse_document(RcDom::default(), Default::default()).one(html)
}

fn get_attr(attrs: &RefCell<Vec<Attribute>>, name: &str) -> Option<String> {
    attrs
        .borrow()
        .iter()
        .find(|attr| attr.name.local.as_ref() == name)
        .map(|attr| attr.value.to_string())
}

fn tag_name(handle: &Handle) -> Option<String> {
    match &handle.data {
        NodeData::Element { name, .. } => Some(name.local.as_ref().to_string()),
        _ => None,
    }
}

fn text_content(handle: &Handle) -> String {
    let mut text = String::new();
    for child in handle.children.borrow().iter() {
        match &child.data {
            NodeData::Text { contents } => text.push_str(&contents.borrow()),
            _ => text.push_str(&text_content(child)),
        }
    }
    text
}

/// Value of the selected option, or of the first one
fn selected_option(select: &Handle) -> Option<String> {
    fn options(handle: &Handle, found: &mut Vec<Handle>) {
        for child in handle.children.borrow().iter() {
            if tag_name(child).as_deref() == Some("option") {
                found.push(child.clone());
            } else {
                options(child, found);
            }
        }
    }

    let mut found = Vec::new();
    options(select, &mut found);

    let option_attrs = |h: &Handle| match &h.data {
        NodeData::Element { attrs, .. } => Some(attrs.clone()),
        _ => None,
    };
    let chosen = found
        .iter()
        .find(|h| option_attrs(h).is_some_and(|a| get_attr(&a, "selected").is_some()))
        .or_else(|| found.first())?;

    option_attrs(chosen)
        .and_then(|a| get_attr(&a, "value"))
        .or_else(|| Some(text_content(chosen).trim().to_string()))
}

fn control(handle: &Handle) -> Option<Control> {
    let NodeData::Element { name, attrs, .. } = &handle.data else {
        return None;
    };
    let control_name = get_attr(attrs, "name").filter(|n| !n.is_empty())?;
    let lowered = |attr: &str| get_attr(attrs, attr).map(|v| v.trim().to_ascii_lowercase());

    let (kind, value) = match name.local.as_ref() {
        "input" => {
            let kind = lowered("type").unwrap_or_else(|| "text".to_string());
            let value = get_attr(attrs, "value").unwrap_or_else(|| {
                if matches!(kind.as_str(), "checkbox" | "radio") {
                    "on".to_string()
                } else {
                    String::new()
                }
            });
            (kind, value)
        }
        "button" => (
            lowered("type").unwrap_or_else(|| "submit".to_string()),
            get_attr(attrs, "value").unwrap_or_default(),
        ),
        "textarea" => ("textarea".to_string(), text_content(handle)),
        "select" => ("select".to_string(), selected_option(handle).unwrap_or_default()),
        _ => return None,
    };

    Some(Control {
        name: control_name,
        kind,
        value,
        checked: get_attr(attrs, "checked").is_some(),
        disabled: get_attr(attrs, "disabled").is_some(),
    })
}

fn collect_controls(handle: &Handle, controls: &mut Vec<Control>) {
    for child in handle.children.borrow().iter() {
        if let Some(control) = control(child) {
            controls.push(control);
        }
        collect_controls(child, controls);
    }
}

fn collect_forms(handle: &Handle, forms: &mut Vec<Form>) {
    if let NodeData::Element { name, attrs, .. } = &handle.data {
        if name.local.as_ref() == "form" {
            let mut controls = Vec::new();
            collect_controls(handle, &mut controls);
            forms.push(Form {
                action: get_attr(attrs, "action"),
                method: get_attr(attrs, "method")
                    .map(|m| m.trim().to_ascii_lowercase())
                    .unwrap_or_else(|| "get".to_string()),
                controls,
            });
            return;
        }
    }
    for child in handle.children.borrow().iter() {
        collect_forms(child, forms);
    }
}

/// Every named control in the page, inside a form or not
pub fn parse_controls(html: &str) -> Vec<Control> {
    let dom = parse(html);
    let mut controls = Vec::new();
    collect_controls(&dom.document, &mut controls);
    controls
}

/// Every form in the page, in document order
pub fn parse_forms(html: &str) -> Vec<Form> {
    let dom = parse(html);
    let mut forms = Vec::new();
    collect_forms(&dom.document, &mut forms);
    forms
}

/// The form to fill for `names`
///
/// Hotspot pages often carry a hidden relay form with the same input names;
/// a form showing the inputs to the user is preferred over it.
pub fn find_form(html: &str, names: &[&str]) -> Option<Form> {
    let mut candidates: Vec<Form> = parse_forms(html)
        .into_iter()
        .filter(|f| f.has_fields(names))
        .collect();
    let index = candidates
        .iter()
        .position(|f| f.shows_fields(names))
        .unwrap_or(0);
    (index < candidates.len()).then(|| candidates.swap_remove(index))
}

/// Whether the page has controls with all of `names`, inside a form or not
pub fn has_inputs(html: &str, names: &[&str]) -> bool {
    let controls = parse_controls(html);
    names.iter().all(|name| controls.iter().any(|c| c.name == *name))
}
