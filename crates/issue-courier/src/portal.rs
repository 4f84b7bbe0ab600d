//! Portal markup knowledge.
//!
//! Every selector, marker string, and path the courier relies on lives in
//! [`PortalLayout`]. When the portal changes its pages, this is the only
//! file that needs to follow.

use scraper::Selector;
use url::Url;

/// A page that lists issues.
#[derive(Debug, Clone, Copy)]
pub struct ListingPage {
    pub path: &'static str,
    /// Every entry on the page is a purchase; no per-entry marker needed.
    pub purchases_only: bool,
}

fn css(selector: &str) -> Selector {
    Selector::parse(selector).expect("layout selectors are literals")
}

/// Where things are on the portal and how to recognise them.
#[derive(Debug, Clone)]
pub struct PortalLayout {
    /// Entry page carrying the login link.
    pub entry_path: &'static str,
    /// Account page, used as the signed-in probe.
    pub account_path: &'static str,
    /// Listing pages, searched in order.
    pub listing_pages: &'static [ListingPage],
    /// Lower-case keyword an issue title must contain.
    pub title_keyword: &'static str,

    pub login_link: Selector,
    pub login_link_texts: &'static [&'static str],
    pub login_url_fragments: &'static [&'static str],
    pub password_input: Selector,
    pub identity_input: Selector,
    pub iframe: Selector,
    pub form: Selector,
    pub input: Selector,
    pub submit_control: Selector,

    /// Present only when signed in.
    pub signed_in_link: Selector,
    pub signed_in_texts: &'static [&'static str],
    /// Shown when the portal rejects the credentials.
    pub rejection_texts: &'static [&'static str],

    pub listing_entry: Selector,
    pub entry_link: Selector,
    pub entry_title: Selector,
    pub anchor: Selector,
    pub preview_classes: &'static [&'static str],
    pub preview_texts: &'static [&'static str],
    pub purchased_classes: &'static [&'static str],
    pub purchased_texts: &'static [&'static str],
}

impl PortalLayout {
    /// Layout of the gihyo.jp digital publishing store.
    pub fn gihyo() -> Self {
        Self {
            entry_path: "/dp",
            account_path: "/dp/my-page",
            listing_pages: &[
                ListingPage {
                    path: "/dp/my-page",
                    purchases_only: true,
                },
                ListingPage {
                    path: "/dp/my",
                    purchases_only: true,
                },
                ListingPage {
                    path: "/dp",
                    purchases_only: false,
                },
            ],
            title_keyword: "software design",

            login_link: css("a[href*='signin'], a[href*='login'], a[href*='sign_in']"),
            login_link_texts: &["ログイン", "サインイン"],
            login_url_fragments: &["login", "signin", "sign_in"],
            password_input: css(
                "input[type='password'], input[name='password'], input[autocomplete='current-password']",
            ),
            identity_input: css(
                "input[type='email'], input[name='email'], input[autocomplete='username']",
            ),
            iframe: css("iframe[src]"),
            form: css("form"),
            input: css("input"),
            submit_control: css("button[type='submit'][name], input[type='submit'][name]"),

            signed_in_link: css("a[href*='logout'], a[href*='signout'], a[href*='sign_out']"),
            signed_in_texts: &["マイページ", "ログアウト"],
            rejection_texts: &["メールアドレスまたはパスワード"],

            listing_entry: css("li[id^='978-'], .list-book li"),
            entry_link: css("a[href*='/dp/ebook/']"),
            entry_title: css(".title"),
            anchor: css("a[href]"),
            preview_classes: &["sample", "preview", "trial"],
            preview_texts: &["試し読み", "サンプル"],
            purchased_classes: &["purchased", "owned"],
            purchased_texts: &["購入済"],
        }
    }

    pub fn entry_url(&self, base: &Url) -> String {
        join(base, self.entry_path)
    }

    pub fn account_url(&self, base: &Url) -> String {
        join(base, self.account_path)
    }

    /// Listing pages in search order, with their absolute URLs.
    pub fn listing_urls(&self, base: &Url) -> Vec<(String, ListingPage)> {
        self.listing_pages
            .iter()
            .map(|page| (join(base, page.path), *page))
            .collect()
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        self.login_url_fragments.iter().any(|f| lower.contains(f))
    }
}

impl Default for PortalLayout {
    fn default() -> Self {
        Self::gihyo()
    }
}

/// Resolve `href` against `base`, leaving absolute URLs untouched.
pub fn join(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_urls_order() {
        let layout = PortalLayout::gihyo();
        let base = Url::parse("https://gihyo.jp").unwrap();
        let urls: Vec<(String, bool)> = layout
            .listing_urls(&base)
            .into_iter()
            .map(|(url, page)| (url, page.purchases_only))
            .collect();
        assert_eq!(
            urls,
            vec![
                ("https://gihyo.jp/dp/my-page".to_string(), true),
                ("https://gihyo.jp/dp/my".to_string(), true),
                ("https://gihyo.jp/dp".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_login_url_detection() {
        let layout = PortalLayout::gihyo();
        assert!(layout.is_login_url("https://gihyo.jp/site/signin?return_to=/dp"));
        assert!(layout.is_login_url("https://gihyo.jp/dp/LOGIN"));
        assert!(!layout.is_login_url("https://gihyo.jp/dp/my-page"));
    }

    #[test]
    fn test_join_keeps_absolute() {
        let base = Url::parse("https://gihyo.jp/dp/my-page").unwrap();
        assert_eq!(
            join(&base, "https://dl.gihyo.jp/sd.epub"),
            "https://dl.gihyo.jp/sd.epub"
        );
        assert_eq!(join(&base, "/dp/ebook/2024/978-4"), "https://gihyo.jp/dp/ebook/2024/978-4");
    }
}
