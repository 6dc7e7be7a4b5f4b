//! S3 XML response rendering.
//!
//! The data gateway emits only a handful of XML payloads: error
//! documents, `<DeleteResult>` for multi-object delete, and
//! `<CopyObjectResult>`.  All are produced with `quick-xml` writers.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <Resource>/mybucket</Resource>
///   <RequestId>abcd-1234</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .expect("xml decl");

    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── DeleteResult ────────────────────────────────────────────────────

/// A successfully deleted key in a multi-object delete.
pub struct DeletedEntry<'a> {
    pub key: &'a str,
    /// Set when the delete created a delete marker on a versioned bucket.
    pub delete_marker: bool,
    pub delete_marker_version_id: Option<&'a str>,
}

/// A failed key in a multi-object delete. Every failed key carries its
/// stable code string and message.
pub struct DeleteErrorEntry<'a> {
    pub key: &'a str,
    pub code: &'a str,
    pub message: &'a str,
}

/// Render `<DeleteResult>` for DeleteObjects.
///
/// In quiet mode, successfully deleted entries are omitted; error
/// entries are always included.
pub fn render_delete_result(
    deleted: &[DeletedEntry<'_>],
    errors: &[DeleteErrorEntry<'_>],
    quiet: bool,
) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .expect("xml decl");

    let root = BytesStart::new("DeleteResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    if !quiet {
        for entry in deleted {
            writer
                .write_event(Event::Start(BytesStart::new("Deleted")))
                .expect("start Deleted");
            write_text_element(&mut writer, "Key", entry.key);
            if entry.delete_marker {
                write_text_element(&mut writer, "DeleteMarker", "true");
                if let Some(vid) = entry.delete_marker_version_id {
                    write_text_element(&mut writer, "DeleteMarkerVersionId", vid);
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new("Deleted")))
                .expect("end Deleted");
        }
    }

    for entry in errors {
        write_simple_element_group(
            &mut writer,
            "Error",
            &[
                ("Key", entry.key),
                ("Code", entry.code),
                ("Message", entry.message),
            ],
        );
    }

    writer
        .write_event(Event::End(BytesEnd::new("DeleteResult")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── CopyObjectResult ────────────────────────────────────────────────

/// Render `<CopyObjectResult>` for CopyObject.
pub fn render_copy_object_result(etag: &str, last_modified: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
            "1.0",
            Some("UTF-8"),
            None,
        )))
        .expect("xml decl");

    let root = BytesStart::new("CopyObjectResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "LastModified", last_modified);
    write_text_element(&mut writer, "ETag", etag);

    writer
        .write_event(Event::End(BytesEnd::new("CopyObjectResult")))
        .expect("end root");

    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    parent: &str,
    children: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_contains_code_and_message() {
        let xml = render_error("NoSuchKey", "The specified key does not exist.", "/b/k", "R1");
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Message>The specified key does not exist.</Message>"));
        assert!(xml.contains("<Resource>/b/k</Resource>"));
        assert!(xml.contains("<RequestId>R1</RequestId>"));
    }

    #[test]
    fn test_render_delete_result_lists_all_deleted() {
        let deleted: Vec<DeletedEntry<'_>> = (0..3)
            .map(|_| DeletedEntry {
                key: "k",
                delete_marker: false,
                delete_marker_version_id: None,
            })
            .collect();
        let xml = render_delete_result(&deleted, &[], false);
        assert_eq!(xml.matches("<Deleted>").count(), 3);
        assert!(!xml.contains("<Error>"));
    }

    #[test]
    fn test_render_delete_result_quiet_omits_deleted() {
        let deleted = [DeletedEntry {
            key: "k",
            delete_marker: false,
            delete_marker_version_id: None,
        }];
        let errors = [DeleteErrorEntry {
            key: "locked",
            code: "AccessDenied",
            message: "Access Denied",
        }];
        let xml = render_delete_result(&deleted, &errors, true);
        assert!(!xml.contains("<Deleted>"));
        assert!(xml.contains("<Key>locked</Key>"));
        assert!(xml.contains("<Code>AccessDenied</Code>"));
        assert!(xml.contains("<Message>Access Denied</Message>"));
    }

    #[test]
    fn test_render_delete_result_delete_marker_fields() {
        let deleted = [DeletedEntry {
            key: "k",
            delete_marker: true,
            delete_marker_version_id: Some("v123"),
        }];
        let xml = render_delete_result(&deleted, &[], false);
        assert!(xml.contains("<DeleteMarker>true</DeleteMarker>"));
        assert!(xml.contains("<DeleteMarkerVersionId>v123</DeleteMarkerVersionId>"));
    }

    #[test]
    fn test_render_copy_object_result() {
        let xml =
            render_copy_object_result("\"d41d8cd98f00b204e9800998ecf8427e\"", "2026-03-01T00:00:00.000Z");
        assert!(xml.contains("<CopyObjectResult"));
        assert!(xml.contains("ETag"));
        assert!(xml.contains("2026-03-01T00:00:00.000Z"));
    }
}
