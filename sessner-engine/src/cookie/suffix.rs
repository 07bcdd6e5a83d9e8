//! Domain scope boundaries backed by the Public Suffix List.
//!
//! Cookie lookup walks dot-prefixed suffixes of the request host but must
//! never cross the registrable-domain boundary: a cookie keyed
//! `.example.com` is legitimate, one keyed `.com` must never match.

/// Candidate cookie-store keys for a request host, most specific first.
///
/// The exact host key comes first, then every dot-prefixed suffix down to
/// and including the registrable domain (public suffix + one label). For
/// hosts without a registrable domain (IP literals, single labels, bare
/// public suffixes) only the exact and dotted-exact keys are produced.
pub fn domain_lookup_keys(host: &str) -> Vec<String> {
    let mut keys = vec![host.to_owned(), format!(".{host}")];
    let Some(registrable) = psl::domain_str(host) else {
        return keys;
    };
    if registrable == host {
        return keys;
    }
    let mut rest = host;
    while let Some((_, parent)) = rest.split_once('.') {
        keys.push(format!(".{parent}"));
        if parent == registrable {
            break;
        }
        rest = parent;
    }
    keys
}

/// RFC 6265 host matching used by the change capturer: exact host, or
/// `host` ends with `.d` where `d` is the cookie domain without any
/// leading dot.
pub fn host_matches_domain(cookie_domain: &str, host: &str) -> bool {
    let d = cookie_domain.trim_start_matches('.');
    if d.is_empty() {
        return false;
    }
    host == d || host.strip_suffix(d).is_some_and(|rest| rest.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_stop_at_registrable_domain() {
        assert_eq!(
            domain_lookup_keys("a.b.example.com"),
            vec![
                "a.b.example.com",
                ".a.b.example.com",
                ".b.example.com",
                ".example.com"
            ]
        );
    }

    #[test]
    fn public_suffix_is_never_a_key() {
        for key in domain_lookup_keys("app.example.co.uk") {
            assert_ne!(key, ".co.uk");
            assert_ne!(key, ".uk");
        }
        assert!(domain_lookup_keys("app.example.co.uk").contains(&".example.co.uk".to_owned()));
    }

    #[test]
    fn registrable_host_gets_exact_and_dotted_keys() {
        assert_eq!(
            domain_lookup_keys("example.com"),
            vec!["example.com", ".example.com"]
        );
    }

    #[test]
    fn single_label_host() {
        assert_eq!(domain_lookup_keys("localhost"), vec!["localhost", ".localhost"]);
    }

    #[test]
    fn ends_with_matching() {
        assert!(host_matches_domain(".example.com", "example.com"));
        assert!(host_matches_domain(".example.com", "a.example.com"));
        assert!(host_matches_domain("example.com", "a.b.example.com"));
        assert!(!host_matches_domain("example.com", "badexample.com"));
        assert!(!host_matches_domain(".", "example.com"));
    }
}
