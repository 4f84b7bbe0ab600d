//! Login form discovery and filling from raw HTML.

use super::{FormMethod, FormSubmission};
use crate::config::Credentials;
use crate::portal::{join, PortalLayout};
use scraper::{ElementRef, Html};
use url::Url;

/// A login form found on a page.
#[derive(Debug, Clone)]
pub struct LoginForm {
    pub action: String,
    pub method: FormMethod,
    pub identity_field: String,
    pub secret_field: String,
    /// Hidden inputs (CSRF tokens and the like) submitted as-is.
    pub hidden: Vec<(String, String)>,
    /// Named submit control, when the form has one.
    pub submit: Option<(String, String)>,
}

impl LoginForm {
    /// Fill identity and secret, producing a submission.
    pub fn fill(&self, credentials: &Credentials) -> FormSubmission {
        let mut fields = self.hidden.clone();
        fields.push((self.identity_field.clone(), credentials.identity.clone()));
        fields.push((
            self.secret_field.clone(),
            credentials.secret.expose().to_string(),
        ));
        if let Some(submit) = &self.submit {
            fields.push(submit.clone());
        }
        FormSubmission {
            action: self.action.clone(),
            method: self.method,
            fields,
        }
    }
}

/// Find the form that owns a password input.
pub fn find_login_form(html: &str, page_url: &Url, layout: &PortalLayout) -> Option<LoginForm> {
    let document = Html::parse_document(html);
    document
        .select(&layout.form)
        .find_map(|form| login_form_from(form, page_url, layout))
}

/// `src` of the first iframe, for portals that embed the login form.
pub fn login_frame_src(html: &str, page_url: &Url, layout: &PortalLayout) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&layout.iframe)
        .filter_map(|f| f.value().attr("src"))
        .find(|src| !src.trim().is_empty() && !src.starts_with("about:"))
        .map(|src| join(page_url, src))
}

/// Whether the page carries any password input.
pub fn has_password_input(html: &str, layout: &PortalLayout) -> bool {
    Html::parse_document(html)
        .select(&layout.password_input)
        .next()
        .is_some()
}

fn login_form_from(form: ElementRef<'_>, page_url: &Url, layout: &PortalLayout) -> Option<LoginForm> {
    let secret_field = form
        .select(&layout.password_input)
        .find_map(|i| i.value().attr("name"))?
        .to_string();

    let identity_field = form
        .select(&layout.identity_input)
        .find_map(|i| i.value().attr("name"))
        .or_else(|| {
            // Fall back to the first visible text-like input.
            form.select(&layout.input).find_map(|i| {
                let ty = i.value().attr("type").unwrap_or("text");
                matches!(ty, "text" | "email")
                    .then(|| i.value().attr("name"))
                    .flatten()
            })
        })?
        .to_string();

    let hidden = form
        .select(&layout.input)
        .filter(|i| i.value().attr("type") == Some("hidden"))
        .filter_map(|i| {
            let name = i.value().attr("name")?;
            Some((name.to_string(), i.value().attr("value").unwrap_or("").to_string()))
        })
        .collect();

    let submit = form.select(&layout.submit_control).next().and_then(|s| {
        let name = s.value().attr("name")?;
        Some((name.to_string(), s.value().attr("value").unwrap_or("").to_string()))
    });

    let action = match form.value().attr("action") {
        Some(a) if !a.trim().is_empty() => join(page_url, a.trim()),
        _ => page_url.to_string(),
    };

    Some(LoginForm {
        action,
        method: FormMethod::from_attr(form.value().attr("method")),
        identity_field,
        secret_field,
        hidden,
        submit,
    })
}
