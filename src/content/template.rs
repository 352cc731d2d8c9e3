//! HTML pages: error pages, redirects and directory listings.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::content::fs::{human_size, DirEntry};
use crate::http::response::SERVER_SOFTWARE;

/// Characters escaped in a path segment of a listing link.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Slots of the page layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page<'a> {
    pub title: &'a str,
    /// Extra markup for `<head>`.
    pub head: &'a str,
    /// Page heading; defaults to the title.
    pub header: Option<&'a str>,
    pub body: &'a str,
    pub footer: &'a str,
}

pub fn render(page: &Page<'_>) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=utf-8>\
         <meta name=viewport content=\"width=device-width\">\
         <title>{title}</title>{head}\
         <style>body{{font-family:sans-serif;background:#eee;color:#333;}}\
         a{{text-decoration:none;}}a:hover{{text-decoration:underline;}}</style>\
         </head><body><h1>{header}</h1>{body}<hr>{footer}\
         <center>{software}</center></body></html>",
        title = page.title,
        head = page.head,
        header = page.header.unwrap_or(page.title),
        body = page.body,
        footer = page.footer,
        software = SERVER_SOFTWARE,
    )
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

pub fn error_page(code: u16, reason: &str, explain: &str) -> String {
    let title = format!("{} {}", code, escape_html(reason));
    let body = format!("<p>Error code: {}</p><p>{}</p>", code, escape_html(explain));
    render(&Page {
        title: &title,
        body: &body,
        ..Page::default()
    })
}

pub fn redirect_page(location: &str) -> String {
    let escaped = escape_html(location);
    let body = format!("<p>The document has moved <a href=\"{0}\">here</a>.</p>", escaped);
    render(&Page {
        title: "Moved",
        body: &body,
        ..Page::default()
    })
}

/// Listing for the directory at URL path `dir_path`.
pub fn directory_listing(dir_path: &str, entries: &[DirEntry]) -> String {
    let dir_path = dir_path.trim_end_matches('/');

    // Breadcrumbs: every ancestor links upward with `../`.
    let mut crumbs = Vec::new();
    let mut up = String::new();
    for part in dir_path.split('/').rev() {
        let label = if part.is_empty() { "Home".to_string() } else { escape_html(part) };
        if up.is_empty() {
            crumbs.push(label);
        } else {
            crumbs.push(format!("<a href=\"{}\">{}</a>", up, label));
        }
        up.push_str("../");
    }
    crumbs.reverse();

    let mut body = crumbs.join(" / ");
    body.push_str("<hr><ul>");
    for entry in entries {
        let href = utf8_percent_encode(&entry.name, SEGMENT).to_string();
        let name = escape_html(&entry.name);
        if entry.is_dir {
            body.push_str(&format!(
                "<li class=\"dir\"><span class=\"type\">[DIR]</span> <a href=\"{}/\">{}</a></li>",
                href, name
            ));
        } else {
            body.push_str(&format!(
                "<li class=\"file\"><span class=\"type\">[{}]</span> <a href=\"{}\">{}</a></li>",
                human_size(entry.size),
                href,
                name
            ));
        }
    }
    if entries.is_empty() {
        body.push_str("<li>Empty</li>");
    }
    body.push_str("</ul>");

    let header = format!("Directory listing for {}", escape_html(if dir_path.is_empty() { "/" } else { dir_path }));
    render(&Page {
        title: "Directory Listing",
        head: "<style>ul{margin:0;padding-left:20px;line-height:2;}li a{word-break:break-all;}li.dir{font-weight:bold;}</style>",
        header: Some(&header),
        body: &body,
        ..Page::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#x27;x&#x27;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn error_page_mentions_code() {
        let page = error_page(404, "Not Found", "Nothing matches the given URI");
        assert!(page.contains("<title>404 Not Found</title>"));
        assert!(page.contains("Nothing matches the given URI"));
    }

    #[test]
    fn listing_links_and_breadcrumbs() {
        let entries = vec![
            DirEntry { name: "sub dir".into(), is_dir: true, size: 0 },
            DirEntry { name: "a&b.txt".into(), is_dir: false, size: 2048 },
        ];
        let page = directory_listing("/docs/api/", &entries);
        assert!(page.contains("<a href=\"../../\">Home</a> / <a href=\"../\">docs</a> / api"));
        assert!(page.contains("<a href=\"sub%20dir/\">sub dir</a>"));
        assert!(page.contains("[2.00 KB]</span> <a href=\"a%26b.txt\">a&amp;b.txt</a>"));
        assert!(page.contains("Directory listing for /docs/api"));
    }

    #[test]
    fn empty_listing() {
        let page = directory_listing("/", &[]);
        assert!(page.contains("<li>Empty</li>"));
        assert!(page.contains("Directory listing for /"));
    }
}
