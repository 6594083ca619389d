//! Property-based tests for request translation, write buffering and
//! listing parsing.

use bytes::Bytes;
use proptest::prelude::*;
use restfs_fuse::handle::WriteBuffer;
use restfs_fuse::listing::parse_listing;
use restfs_fuse::translate::RemoteOp;
use restfs_fuse::{Adapter, CallId, NoopAdapter, RemotePath, Scheme, Translator, Verb};
use url::Url;

/// Path segments, including characters that need percent-encoding.
fn any_segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _%+&=#?é~-]{1,12}"
}

fn any_path() -> impl Strategy<Value = RemotePath> {
    proptest::collection::vec(any_segment(), 1..5)
        .prop_map(|segments| RemotePath::parse(&format!("/{}", segments.join("/"))).unwrap())
}

fn translator() -> Translator {
    Translator::new(Scheme::Https, "example.com").unwrap()
}

/// The remote path a URL points at, decoded.
fn decoded_path(url: &str) -> String {
    let url = Url::parse(url).unwrap();
    assert_eq!(url.host_str(), Some("example.com"));
    urlencoding::decode(url.path()).unwrap().into_owned()
}

proptest! {
    #[test]
    fn prop_url_round_trips_path(path in any_path()) {
        let url = translator().url_for(&path, false);
        prop_assert_eq!(decoded_path(&url), path.as_str());
        let dir_url = translator().url_for(&path, true);
        prop_assert_eq!(decoded_path(&dir_url), format!("{}/", path));
    }

    #[test]
    fn prop_read_range_covers_request(path in any_path(), offset in 0u64..1 << 40, len in 1u32..1 << 20) {
        let op = RemoteOp::Read { path: path.clone(), offset, len };
        let req = translator().translate(CallId(1), &op, Some(3)).unwrap();
        prop_assert_eq!(req.verb, Verb::Get);
        prop_assert_eq!(req.fh, Some(3));
        prop_assert!(req.body.is_none());
        let range = req.headers.get("range").unwrap().to_str().unwrap().to_string();
        prop_assert_eq!(range, format!("bytes={}-{}", offset, offset + u64::from(len) - 1));
    }

    #[test]
    fn prop_partial_write_range_matches_payload(
        path in any_path(),
        offset in 0u64..1 << 40,
        data in proptest::collection::vec(any::<u8>(), 1..256),
    ) {
        let op = RemoteOp::Write {
            path,
            offset,
            data: Bytes::from(data.clone()),
            replace: false,
        };
        let req = translator().translate(CallId(2), &op, None).unwrap();
        prop_assert_eq!(req.verb, Verb::Put);
        let range = req.headers.get("content-range").unwrap().to_str().unwrap().to_string();
        prop_assert_eq!(range, format!("bytes {}-{}/*", offset, offset + data.len() as u64 - 1));
        prop_assert_eq!(req.body.as_deref(), Some(&data[..]));
    }

    #[test]
    fn prop_replacing_write_has_no_range(path in any_path(), data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let op = RemoteOp::Write {
            path,
            offset: 0,
            data: Bytes::from(data),
            replace: true,
        };
        let req = translator().translate(CallId(3), &op, None).unwrap();
        prop_assert_eq!(req.verb, Verb::Put);
        prop_assert!(req.headers.get("content-range").is_none());
    }

    #[test]
    fn prop_rename_destination_is_target_url(from in any_path(), to in any_path()) {
        let op = RemoteOp::Rename { from: from.clone(), to: to.clone() };
        let req = translator().translate(CallId(4), &op, None).unwrap();
        prop_assert_eq!(req.verb, Verb::Move);
        prop_assert_eq!(decoded_path(&req.url), from.as_str());
        let destination = req.headers.get("destination").unwrap().to_str().unwrap().to_string();
        prop_assert_eq!(decoded_path(&destination), to.as_str());
    }

    #[test]
    fn prop_noop_precommit_is_identity(path in any_path(), offset in 0u64..4096, len in 1u32..4096) {
        let t = translator();
        for op in [
            RemoteOp::Lookup { path: path.clone() },
            RemoteOp::ReadDir { path: path.clone() },
            RemoteOp::Read { path: path.clone(), offset, len },
            RemoteOp::Create { path: path.clone() },
            RemoteOp::Mkdir { path: path.clone() },
            RemoteOp::Unlink { path: path.clone() },
        ] {
            let request = t.translate(CallId(5), &op, None).unwrap().to_adapter_request();
            let out = NoopAdapter.precommit(request.clone()).unwrap();
            prop_assert_eq!(&out, &request);
            prop_assert!(out.validate().is_ok());
        }
    }

    #[test]
    fn prop_write_buffer_matches_flat_model(
        writes in proptest::collection::vec((0u64..64, proptest::collection::vec(any::<u8>(), 1..16)), 1..20),
    ) {
        let mut buffer = WriteBuffer::default();
        let mut model: Vec<Option<u8>> = vec![None; 128];
        for (offset, data) in &writes {
            if !buffer.can_absorb(*offset, data.len()) {
                continue;
            }
            prop_assert!(buffer.absorb(*offset, data));
            for (i, byte) in data.iter().enumerate() {
                model[*offset as usize + i] = Some(*byte);
            }
        }
        let (start, bytes) = buffer.take();
        for (i, byte) in bytes.iter().enumerate() {
            let at = start as usize + i;
            // bytes never written inside the buffered span read as zero
            prop_assert_eq!(*byte, model[at].unwrap_or(0));
        }
        prop_assert!(buffer.is_empty());
    }

    #[test]
    fn prop_listing_parser_never_panics(body in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = parse_listing("https://example.com/dir/", None, &body);
        let _ = parse_listing("https://example.com/dir/", Some("text/html"), &body);
        let _ = parse_listing("https://example.com/dir/", Some("application/json"), &body);
    }

    #[test]
    fn prop_listing_names_are_clean(names in proptest::collection::vec("[a-z0-9./]{0,10}", 0..20)) {
        let body = names.join("\n");
        let entries = parse_listing("https://example.com/", Some("text/plain"), body.as_bytes()).unwrap();
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            prop_assert!(!entry.name.is_empty());
            prop_assert!(entry.name != "." && entry.name != "..");
            prop_assert!(!entry.name.contains('/'));
            prop_assert!(seen.insert(entry.name.clone()));
        }
    }
}
