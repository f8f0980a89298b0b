use plate_core::{
    AttrPatch, Attrs, Document, Editor, Node, Op, PluginRegistry, Point, Range, Selection,
    Transaction,
};
use serde_json::json;

fn editor_with_text(text: &str) -> Editor {
    let doc = Document {
        children: vec![Node::paragraph(text)],
    };
    let selection = Selection::collapsed(Point::new(vec![0], 0));
    Editor::new(doc, selection, PluginRegistry::core())
}

fn caret_offset(editor: &Editor) -> usize {
    editor.selection().focus().map(|p| p.offset).unwrap_or_default()
}

#[test]
fn undo_redo_handles_multi_op_insert_order() {
    let mut editor = editor_with_text("");

    let tx = Transaction::new(vec![
        Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "a".to_string(),
        },
        Op::InsertText {
            path: vec![0, 0],
            offset: 1,
            text: "b".to_string(),
        },
    ])
    .selection_after(Selection::collapsed(Point::new(vec![0], 2)))
    .source("test:multi_insert");

    editor.apply(tx).unwrap();
    assert_eq!(editor.doc().children, vec![Node::paragraph("ab")]);
    assert_eq!(caret_offset(&editor), 2);

    assert!(editor.undo());
    assert_eq!(editor.doc().children, vec![Node::paragraph("")]);
    assert_eq!(caret_offset(&editor), 0);

    assert!(editor.redo());
    assert_eq!(editor.doc().children, vec![Node::paragraph("ab")]);
    assert_eq!(caret_offset(&editor), 2);
}

#[test]
fn undo_redo_handles_multi_op_paste_newline_shape() {
    let mut editor = editor_with_text("XYZ");
    let selection_before = editor.selection().clone();

    let tx = Transaction::new(vec![
        Op::RemoveText {
            path: vec![0, 0],
            range: 0..3,
        },
        Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "a".to_string(),
        },
        Op::InsertNode {
            path: vec![1],
            node: Node::paragraph("bXYZ"),
        },
    ])
    .selection_after(Selection::collapsed(Point::new(vec![1], 1)))
    .source("test:paste_newline");

    editor.apply(tx).unwrap();
    let doc_after = editor.doc().clone();
    let selection_after = editor.selection().clone();

    assert_eq!(doc_after.children.len(), 2);
    assert_eq!(selection_after.focus(), Some(&Point::new(vec![1], 1)));

    assert!(editor.undo());
    assert_eq!(editor.doc().children, vec![Node::paragraph("XYZ")]);
    assert_eq!(editor.selection(), &selection_before);

    assert!(editor.redo());
    assert_eq!(editor.doc(), &doc_after);
    assert_eq!(editor.selection(), &selection_after);
}

#[test]
fn undo_restores_split_leaves_and_their_attributes() {
    let mut editor = editor_with_text("abcde");
    let doc_before = editor.doc().clone();

    let tx = Transaction::new(vec![
        Op::SplitText {
            path: vec![0, 0],
            offset: 3,
        },
        Op::SplitText {
            path: vec![0, 0],
            offset: 1,
        },
        Op::SetNodeAttrs {
            path: vec![0, 1],
            patch: AttrPatch::default().with_set("bold", json!(true)),
        },
    ])
    .selection_after(Selection::from_range(Range::new(
        Point::new(vec![0], 1),
        Point::new(vec![0], 3),
    )))
    .source("test:split_set");

    editor.apply(tx).unwrap();
    let doc_after = editor.doc().clone();
    let Node::Element(paragraph) = &doc_after.children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(
        paragraph.children,
        vec![
            Node::text("a"),
            Node::text_with_attrs("bc", Attrs::from([("bold".to_string(), json!(true))])),
            Node::text("de"),
        ]
    );

    assert!(editor.undo());
    assert_eq!(editor.doc(), &doc_before);

    assert!(editor.redo());
    assert_eq!(editor.doc(), &doc_after);
}

#[test]
fn undo_stack_is_capped_by_config() {
    let config = plate_core::EditorConfig::from_json_str(r#"{ "max_undo": 2 }"#).unwrap();
    let doc = Document {
        children: vec![Node::paragraph("")],
    };
    let mut editor = Editor::with_config(
        doc,
        Selection::collapsed(Point::new(vec![0], 0)),
        PluginRegistry::core(),
        config,
    );

    for text in ["a", "b", "c"] {
        editor
            .run_command("core.insert_text", Some(json!({ "text": text })))
            .unwrap();
    }
    assert_eq!(editor.doc().children, vec![Node::paragraph("abc")]);

    assert!(editor.undo());
    assert!(editor.undo());
    assert!(!editor.undo());
    assert_eq!(editor.doc().children, vec![Node::paragraph("a")]);
}
