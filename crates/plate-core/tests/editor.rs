use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use plate_core::dev_utils::{parse, stringify};
use plate_core::{
    ApplyError, ChangeEvent, Editor, Node, Op, PluginRegistry, Point, Range, Selection,
    SelectionError, Transaction, attr_is_set,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn editor(markup: &str) -> Editor {
    let registry = PluginRegistry::core();
    let (doc, selection) = parse(markup, registry.schema()).unwrap();
    Editor::new(doc, selection, registry)
}

fn data(editor: &Editor) -> String {
    stringify(editor.doc(), editor.selection(), editor.schema())
}

#[test]
fn failed_transaction_rolls_back_and_stays_silent() {
    let mut editor = editor("<paragraph>fo[o]bar</paragraph>");
    let events = Arc::new(AtomicUsize::new(0));
    let seen = events.clone();
    editor.on_change(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let before = data(&editor);
    let tx = Transaction::new(vec![
        Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "xx".to_string(),
        },
        Op::RemoveNode {
            path: vec![0, 7],
        },
    ]);

    let err = editor.apply(tx).unwrap_err();
    assert!(matches!(err, ApplyError::InvalidPath(_)));
    assert_eq!(data(&editor), before);
    assert_eq!(events.load(Ordering::SeqCst), 0);
    assert!(!editor.can_undo());
}

#[test]
fn inverted_selection_after_is_rejected_up_front() {
    let mut editor = editor("<paragraph>foo[]</paragraph>");
    let tx = Transaction::new(Vec::new()).selection_after(Selection::from_range(Range::new(
        Point::new(vec![0], 2),
        Point::new(vec![0], 1),
    )));
    assert!(matches!(
        editor.apply(tx),
        Err(ApplyError::Selection(SelectionError::Malformed { .. }))
    ));
}

#[test]
fn listeners_run_after_commit_and_can_be_detached() {
    let mut editor = editor("<paragraph>foo[]</paragraph>");
    let events = Arc::new(recorder::Log::default());
    let log = events.clone();
    let id = editor.on_change(move |editor, event| {
        log.push(event.clone(), editor.doc().children.clone());
    });

    editor
        .run_command("core.insert_text", Some(json!({ "text": "d" })))
        .unwrap();

    let recorded = events.take();
    assert_eq!(recorded.len(), 1);
    let (event, children) = &recorded[0];
    assert_eq!(
        event,
        &ChangeEvent {
            document_changed: true,
            selection_changed: true,
            schema_changed: false,
            source: Some("command:core.insert_text".to_string()),
        }
    );
    assert_eq!(children, &vec![Node::paragraph("food")]);

    assert!(editor.off_change(id));
    assert!(!editor.off_change(id));
    editor
        .run_command("core.insert_text", Some(json!({ "text": "s" })))
        .unwrap();
    assert!(events.take().is_empty());
    assert_eq!(editor.listener_count(), 0);
}

#[test]
fn schema_updates_notify_listeners() {
    let mut editor = editor("<paragraph>[]</paragraph>");
    let schema_events = Arc::new(AtomicUsize::new(0));
    let seen = schema_events.clone();
    editor.on_change(move |_, event| {
        if event.schema_changed {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    editor.add_attribute_check(|_ctx, key| (key == "locked").then_some(false));
    editor.update_schema(|schema| schema.allow_attributes("$text", ["bold"]));

    assert_eq!(schema_events.load(Ordering::SeqCst), 2);
}

#[test]
fn selection_attributes_follow_caret_and_overrides() {
    let mut editor = editor(r#"<paragraph><$text bold="true">fo[]o</$text>bar</paragraph>"#);
    assert!(attr_is_set(&editor.selection_attrs(), "bold"));

    editor.remove_selection_attribute("bold").unwrap();
    assert!(!attr_is_set(&editor.selection_attrs(), "bold"));

    editor.set_selection_attribute("italic", json!(true)).unwrap();
    let attrs = editor.selection_attrs();
    assert!(attr_is_set(&attrs, "italic"));
    assert!(!attr_is_set(&attrs, "bold"));

    // Overrides only change the selection.
    assert_eq!(
        data(&editor),
        r#"<paragraph><$text bold="true">fo[]o</$text>bar</paragraph>"#
    );

    assert!(editor.undo());
    assert!(editor.undo());
    assert!(attr_is_set(&editor.selection_attrs(), "bold"));
}

#[test]
fn typing_uses_selection_attributes() {
    let mut editor = editor("<paragraph>foo[]bar</paragraph>");
    editor.set_selection_attribute("bold", json!(true)).unwrap();
    editor
        .run_command("core.insert_text", Some(json!({ "text": "X" })))
        .unwrap();
    assert_eq!(
        data(&editor),
        r#"<paragraph>foo<$text bold="true">X</$text>[]bar</paragraph>"#
    );

    editor
        .run_command("core.insert_text", Some(json!({ "text": "Y" })))
        .unwrap();
    assert_eq!(
        data(&editor),
        r#"<paragraph>foo<$text bold="true">XY</$text>[]bar</paragraph>"#
    );
}

#[test]
fn typing_into_an_empty_block_with_overrides() {
    let mut editor = editor("<paragraph>[]</paragraph>");
    editor.set_selection_attribute("bold", json!(true)).unwrap();
    editor
        .run_command("core.insert_text", Some(json!({ "text": "a" })))
        .unwrap();
    assert_eq!(
        data(&editor),
        r#"<paragraph><$text bold="true">a</$text>[]</paragraph>"#
    );
}

#[test]
fn set_selection_rejects_malformed_and_snaps_dangling_points() {
    let mut editor = editor("<paragraph>foo[]</paragraph><paragraph>bar</paragraph>");

    let inverted = Selection::from_range(Range::new(
        Point::new(vec![1], 2),
        Point::new(vec![0], 1),
    ));
    assert!(matches!(
        editor.set_selection(inverted),
        Err(SelectionError::Malformed { .. })
    ));
    assert_eq!(
        data(&editor),
        "<paragraph>foo[]</paragraph><paragraph>bar</paragraph>"
    );

    editor
        .set_selection(Selection::collapsed(Point::new(vec![1], 99)))
        .unwrap();
    assert_eq!(
        data(&editor),
        "<paragraph>foo</paragraph><paragraph>bar[]</paragraph>"
    );
}

#[test]
fn points_inside_a_character_are_rejected_or_floored() {
    let registry = PluginRegistry::core();
    let (doc, _) = parse("<paragraph>[]aéb</paragraph>", registry.schema()).unwrap();
    let inside = Selection::collapsed(Point::new(vec![0], 2));

    assert_eq!(
        doc.check_selection(registry.schema(), &inside),
        Err(SelectionError::NotCharBoundary {
            path: vec![0],
            offset: 2
        })
    );

    // A stale point handed to the constructor lands on the character start.
    let mut editor = Editor::new(doc, inside.clone(), registry);
    assert_eq!(data(&editor), "<paragraph>a[]éb</paragraph>");

    assert!(matches!(
        editor.set_selection(inside),
        Err(SelectionError::NotCharBoundary { offset: 2, .. })
    ));
    assert_eq!(data(&editor), "<paragraph>a[]éb</paragraph>");
}

#[test]
fn normalization_merges_equal_neighbours() {
    let mut editor = editor(r#"<paragraph>a[]<image></image>b</paragraph>"#);
    editor
        .apply(Transaction::new(vec![Op::RemoveNode {
            path: vec![0, 1],
        }]))
        .unwrap();

    assert_eq!(editor.doc().children, vec![Node::paragraph("ab")]);
    assert_eq!(editor.doc().node(&[0, 0]), Some(&Node::text("ab")));
    assert_eq!(editor.doc().node(&[0, 1]), None);
    assert_eq!(data(&editor), "<paragraph>a[]b</paragraph>");
}

#[test]
fn unknown_command_and_query_are_reported() {
    let mut editor = editor("<paragraph>[]</paragraph>");
    let err = editor.run_command("nope", None).unwrap_err();
    assert_eq!(err.message(), "Unknown command: nope");
    let err = editor.run_query_json("nope", None).unwrap_err();
    assert_eq!(err.message(), "Unknown query: nope");
}

mod recorder {
    use std::sync::Mutex;

    use plate_core::{ChangeEvent, Node};

    #[derive(Default)]
    pub struct Log(Mutex<Vec<(ChangeEvent, Vec<Node>)>>);

    impl Log {
        pub fn push(&self, event: ChangeEvent, children: Vec<Node>) {
            self.0.lock().unwrap().push((event, children));
        }

        pub fn take(&self) -> Vec<(ChangeEvent, Vec<Node>)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
}
