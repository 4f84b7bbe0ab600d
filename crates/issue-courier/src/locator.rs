//! Latest-issue detection.
//!
//! Walks the purchase listings, keeps entries whose title names the
//! periodical and that are real purchases (not previews), picks the newest
//! by the issue date in its title, then resolves the EPUB link on the
//! issue's detail page.

use crate::auth::AuthenticatedSession;
use crate::browser::PortalBrowser;
use crate::capture::PageCapture;
use crate::error::{CourierError, CourierResult};
use crate::portal::{join, PortalLayout};
use regex::Regex;
use scraper::{ElementRef, Html};
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use url::Url;

/// How the artifact is packaged at the download URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArtifactFormat {
    Epub,
    /// A ZIP archive holding the EPUB.
    ZippedEpub,
}

/// Where to fetch the artifact from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReference {
    pub url: String,
    pub format: ArtifactFormat,
}

/// The issue selected for this run.
#[derive(Debug, Clone, Serialize)]
pub struct IssueDescriptor {
    /// Issue label as shown in the listing.
    pub identifier: String,
    pub reference: DownloadReference,
    pub detail_url: String,
}

/// One eligible entry of a listing page.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub title: String,
    pub detail_url: String,
    /// `(year, month)` parsed from the title.
    pub issue_date: Option<(u32, u32)>,
    /// Download link found inside the entry itself.
    pub inline_reference: Option<DownloadReference>,
}

pub struct IssueLocator<'a> {
    base: &'a Url,
    layout: &'a PortalLayout,
    capture: &'a PageCapture,
}

impl<'a> IssueLocator<'a> {
    pub fn new(base: &'a Url, layout: &'a PortalLayout, capture: &'a PageCapture) -> Self {
        Self {
            base,
            layout,
            capture,
        }
    }

    /// Find the newest purchased issue and its download reference.
    pub async fn find_latest_issue<B>(
        &self,
        browser: &mut B,
        session: &AuthenticatedSession,
    ) -> CourierResult<IssueDescriptor>
    where
        B: PortalBrowser + ?Sized,
    {
        debug!(via = ?session.method, "searching listings");

        let mut entries = Vec::new();
        for (url, listing) in self.layout.listing_urls(self.base) {
            let page = match browser.navigate(&url).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(url = %url, error = %format!("{e:#}"), "listing page failed to load");
                    continue;
                }
            };
            self.capture.page("listing", &page);
            if !page.is_success() || self.layout.is_login_url(&page.url) {
                debug!(url = %url, status = page.status, final_url = %page.url, "listing unavailable");
                continue;
            }

            let page_url = Url::parse(&page.url).map_err(|e| {
                CourierError::NotFound(format!("bad listing URL '{}': {e}", page.url))
            })?;
            entries = parse_listing(&page.html, &page_url, self.layout, listing.purchases_only);
            if !entries.is_empty() {
                debug!(url = %page.url, count = entries.len(), "eligible entries found");
                break;
            }
        }

        let latest = select_latest(entries).ok_or_else(|| {
            CourierError::NotFound(format!(
                "no purchased '{}' issue on any listing page",
                self.layout.title_keyword
            ))
        })?;
        info!(issue = %latest.title, detail = %latest.detail_url, "latest issue");

        let detail = browser
            .navigate(&latest.detail_url)
            .await
            .map_err(|e| e.context(format!("failed to open detail page for '{}'", latest.title)))
            .map_err(CourierError::not_found)?;
        self.capture.page("issue_detail", &detail);

        let from_detail = if detail.is_success() {
            Url::parse(&detail.url)
                .ok()
                .and_then(|u| find_download(&detail.html, &u, self.layout))
        } else {
            None
        };

        let reference = from_detail
            .or_else(|| latest.inline_reference.clone())
            .ok_or_else(|| {
                self.capture.page("issue_detail_no_epub", &detail);
                CourierError::NotFound(format!(
                    "no EPUB download link for '{}' on {}",
                    latest.title, detail.url
                ))
            })?;
        debug!(url = %reference.url, format = ?reference.format, "download reference");

        Ok(IssueDescriptor {
            identifier: latest.title,
            reference,
            detail_url: latest.detail_url,
        })
    }
}

/// Eligible entries of a listing page, in page order.
///
/// On pages that are not purchase-only, an entry must carry a purchased
/// marker to count.
pub fn parse_listing(
    html: &str,
    page_url: &Url,
    layout: &PortalLayout,
    purchases_only: bool,
) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    document
        .select(&layout.listing_entry)
        .filter_map(|entry| {
            let link = entry.select(&layout.entry_link).next()?;
            let href = link.value().attr("href")?.trim();
            let title = entry
                .select(&layout.entry_title)
                .next()
                .map(|t| collapse_ws(&t.text().collect::<Vec<_>>().join(" ")))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| collapse_ws(&link.text().collect::<Vec<_>>().join(" ")));
            if href.is_empty() || title.is_empty() {
                return None;
            }
            if !normalize_title(&title).contains(layout.title_keyword) {
                return None;
            }
            if is_preview(entry, layout) {
                debug!(title = %title, "skipping preview entry");
                return None;
            }
            if !purchases_only && !is_marked_purchased(entry, layout) {
                return None;
            }

            let inline_reference = entry
                .select(&layout.anchor)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|h| classify_link(h).map(|format| (h, format)))
                .map(|(h, format)| DownloadReference {
                    url: join(page_url, h),
                    format,
                });

            Some(ListingEntry {
                issue_date: issue_date(&title),
                detail_url: join(page_url, href),
                title,
                inline_reference,
            })
        })
        .collect()
}

/// Newest entry by title date. Ties and undated entries keep listing order.
pub fn select_latest(mut entries: Vec<ListingEntry>) -> Option<ListingEntry> {
    // Stable sort: the listing is newest-first, so equal keys stay in that order.
    entries.sort_by(|a, b| b.issue_date.cmp(&a.issue_date));
    entries.into_iter().next()
}

/// First EPUB (or zipped EPUB) link on a page.
pub fn find_download(html: &str, page_url: &Url, layout: &PortalLayout) -> Option<DownloadReference> {
    let document = Html::parse_document(html);
    document
        .select(&layout.anchor)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| {
            classify_link(href).map(|format| DownloadReference {
                url: join(page_url, href),
                format,
            })
        })
}

/// Recognise artifact links by path suffix or format query.
pub fn classify_link(href: &str) -> Option<ArtifactFormat> {
    let lower = href.trim().to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or("");
    if path.ends_with(".epub") || lower.contains("format=epub") {
        Some(ArtifactFormat::Epub)
    } else if path.ends_with(".zip") && lower.contains("epub") {
        Some(ArtifactFormat::ZippedEpub)
    } else {
        None
    }
}

/// `(year, month)` from titles like `2024年5月号`, `2024-05`, `2024/5`.
pub fn issue_date(title: &str) -> Option<(u32, u32)> {
    static DATE: OnceLock<Regex> = OnceLock::new();
    let re = DATE.get_or_init(|| {
        Regex::new(r"(?:^|\D)(20\d{2})\s*(?:年|[-/.])\s*(\d{1,2})(?:\D|$)").expect("valid date regex")
    });
    let normalized = normalize_title(title);
    re.captures_iter(&normalized).find_map(|caps| {
        let year = caps[1].parse::<u32>().ok()?;
        let month = caps[2].parse::<u32>().ok()?;
        (1..=12).contains(&month).then_some((year, month))
    })
}

/// Fold full-width ASCII, lower-case, and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    let folded: String = title
        .chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            _ => c,
        })
        .collect();
    collapse_ws(&folded.to_lowercase())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_preview(entry: ElementRef<'_>, layout: &PortalLayout) -> bool {
    has_marker(entry, layout.preview_classes, layout.preview_texts)
}

fn is_marked_purchased(entry: ElementRef<'_>, layout: &PortalLayout) -> bool {
    has_marker(entry, layout.purchased_classes, layout.purchased_texts)
}

fn has_marker(entry: ElementRef<'_>, classes: &[&str], texts: &[&str]) -> bool {
    let class_hit = entry
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter_map(|e| e.value().attr("class"))
        .any(|class| {
            let class = class.to_ascii_lowercase();
            classes.iter().any(|c| class.contains(c))
        });
    if class_hit {
        return true;
    }
    let text: String = entry.text().collect();
    texts.iter().any(|t| text.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://gihyo.jp/dp/my-page").unwrap()
    }

    fn entry(id: &str, title: &str) -> String {
        format!(
            r#"<li id="{id}"><a href="/dp/ebook/{id}"><span class="title">{title}</span></a></li>"#
        )
    }

    #[test]
    fn test_newest_first_listing_selects_first() {
        let html = format!(
            "<ul>{}{}{}</ul>",
            entry("978-1", "Software Design 2024-05"),
            entry("978-2", "Software Design 2024-04"),
            entry("978-3", "Software Design 2024-03"),
        );
        let entries = parse_listing(&html, &url(), &PortalLayout::gihyo(), true);
        assert_eq!(entries.len(), 3);
        let latest = select_latest(entries).unwrap();
        assert_eq!(latest.title, "Software Design 2024-05");
        assert_eq!(latest.detail_url, "https://gihyo.jp/dp/ebook/978-1");
    }

    #[test]
    fn test_date_beats_listing_order() {
        let html = format!(
            "<ul>{}{}{}</ul>",
            entry("978-a", "Software Design 2023年12月号"),
            entry("978-b", "Software Design 2024年1月号"),
            entry("978-c", "Software Design 増刊"),
        );
        let latest = select_latest(parse_listing(&html, &url(), &PortalLayout::gihyo(), true)).unwrap();
        assert_eq!(latest.title, "Software Design 2024年1月号");
    }

    #[test]
    fn test_other_titles_and_previews_skipped() {
        let html = format!(
            r#"<ul>{}<li id="978-p" class="item sample"><a href="/dp/ebook/978-p"><span class="title">Software Design 2024年6月号</span></a></li>{}</ul>"#,
            entry("978-x", "WEB+DB PRESS Vol.140"),
            entry("978-y", "Ｓｏｆｔｗａｒｅ　Ｄｅｓｉｇｎ 2024年5月号"),
        );
        let entries = parse_listing(&html, &url(), &PortalLayout::gihyo(), true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].issue_date, Some((2024, 5)));
    }

    #[test]
    fn test_storefront_requires_purchase_marker() {
        let html = format!(
            r#"<ul>{}<li id="978-z"><a href="/dp/ebook/978-z"><span class="title">Software Design 2024年4月号</span></a><span class="badge">購入済み</span></li></ul>"#,
            entry("978-n", "Software Design 2024年5月号"),
        );
        let entries = parse_listing(&html, &url(), &PortalLayout::gihyo(), false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Software Design 2024年4月号");
    }

    #[test]
    fn test_inline_reference_captured() {
        let html = r#"<ul><li id="978-1"><a href="/dp/ebook/978-1">Software Design 2024年5月号</a>
            <div class="modal"><a href="/dp/download/978-1/sd.pdf">PDF</a><a href="/dp/download/978-1/sd.epub?t=1">EPUB</a></div></li></ul>"#;
        let entries = parse_listing(html, &url(), &PortalLayout::gihyo(), true);
        assert_eq!(
            entries[0].inline_reference,
            Some(DownloadReference {
                url: "https://gihyo.jp/dp/download/978-1/sd.epub?t=1".into(),
                format: ArtifactFormat::Epub,
            })
        );
    }

    #[test]
    fn test_classify_link() {
        assert_eq!(classify_link("/files/sd202405.epub"), Some(ArtifactFormat::Epub));
        assert_eq!(classify_link("/dl?id=1&format=EPUB"), Some(ArtifactFormat::Epub));
        assert_eq!(
            classify_link("/files/sd202405_epub.zip"),
            Some(ArtifactFormat::ZippedEpub)
        );
        assert_eq!(classify_link("/files/sd202405_pdf.zip"), None);
        assert_eq!(classify_link("/files/sd202405.pdf"), None);
        assert_eq!(classify_link("/files/epub-guide.html"), None);
    }

    #[test]
    fn test_find_download_prefers_first_match() {
        let html = r#"<a href="/help">help</a><a href="https://dl.gihyo.jp/a/sd_epub.zip">zip</a><a href="/b.epub">epub</a>"#;
        let found = find_download(html, &url(), &PortalLayout::gihyo()).unwrap();
        assert_eq!(found.url, "https://dl.gihyo.jp/a/sd_epub.zip");
        assert_eq!(found.format, ArtifactFormat::ZippedEpub);
    }

    #[test]
    fn test_issue_date_variants() {
        assert_eq!(issue_date("Software Design 2024年5月号"), Some((2024, 5)));
        assert_eq!(issue_date("Software Design ２０２４年１２月号"), Some((2024, 12)));
        assert_eq!(issue_date("2024-05"), Some((2024, 5)));
        assert_eq!(issue_date("SD 2024/11"), Some((2024, 11)));
        assert_eq!(issue_date("Software Design 2024-13"), None);
        assert_eq!(issue_date("Software Design 総集編"), None);
    }

    #[test]
    fn test_issue_date_ignores_isbn_digits() {
        assert_eq!(issue_date("Software Design 978-4-297-12016-3"), None);
        assert_eq!(
            issue_date("ISBN 978-4-297-12016-3 Software Design 2024年5月号"),
            Some((2024, 5))
        );
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("  Ｓｏｆｔｗａｒｅ　Design\n 2024 "),
            "software design 2024"
        );
    }
}
