//! REST `Link`-header and GraphQL `pageInfo` pagination helpers (§4.B).

/// Extract the `rel="next"` URL from a `Link` response header, tolerant of
/// whitespace and case in the `rel=` parameter the way real GitHub responses (and
/// proxies in front of them) format it.
pub fn parse_link_next(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let mut segments = part.split(';');
        let url_part = segments.next()?.trim();
        let url = url_part.strip_prefix('<')?.strip_suffix('>')?;
        for seg in segments {
            let seg = seg.trim();
            let seg = seg.trim_matches('"');
            let normalized = seg.replace(' ', "").to_ascii_lowercase();
            if normalized == "rel=\"next\"" || normalized == "rel=next" {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// GraphQL `pageInfo` connection cursor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

/// Whether a connection is exhaustively covered, per §4.E's coverage rule: complete
/// iff the API explicitly reported no further page. A connection that never returned
/// `pageInfo` at all is *not* complete — absence is not evidence of completeness.
pub fn is_complete(page_info: Option<&PageInfo>) -> bool {
    matches!(page_info, Some(p) if !p.has_next_page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_next_link_among_multiple_rels() {
        let header = r#"<https://api.github.com/resource?page=2>; rel="next", <https://api.github.com/resource?page=5>; rel="last""#;
        assert_eq!(
            parse_link_next(header),
            Some("https://api.github.com/resource?page=2".to_string())
        );
    }

    #[test]
    fn tolerates_whitespace_and_case_in_rel_param() {
        let header = r#"<https://api.github.com/resource?page=2>;REL  =  "NEXT""#;
        assert_eq!(
            parse_link_next(header),
            Some("https://api.github.com/resource?page=2".to_string())
        );
    }

    #[test]
    fn returns_none_when_no_next_rel_present() {
        let header = r#"<https://api.github.com/resource?page=1>; rel="prev""#;
        assert_eq!(parse_link_next(header), None);
    }

    #[test]
    fn returns_none_for_empty_header() {
        assert_eq!(parse_link_next(""), None);
    }

    #[test]
    fn page_info_incomplete_when_has_next_page_true() {
        let info = PageInfo {
            has_next_page: true,
            end_cursor: Some("abc".into()),
        };
        assert!(!is_complete(Some(&info)));
    }

    #[test]
    fn page_info_complete_when_has_next_page_false() {
        let info = PageInfo {
            has_next_page: false,
            end_cursor: None,
        };
        assert!(is_complete(Some(&info)));
    }

    #[test]
    fn missing_page_info_is_not_complete() {
        assert!(!is_complete(None));
    }
}
