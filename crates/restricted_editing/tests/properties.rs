use plate_core::{Attrs, Document, Editor, Node, Point, Range, Selection, attr_is_set};
use plate_restricted_editing::{
    DEFAULT_ATTRIBUTE, ExecuteOptions, RestrictedEditingExceptionCommand, registry,
};
use quickcheck::{Arbitrary, Gen};

/// A paragraph made of runs with and without the attribute, and one or two
/// non-empty, possibly overlapping selection ranges inside it.
#[derive(Debug, Clone)]
struct Case {
    runs: Vec<(String, bool)>,
    spans: Vec<std::ops::Range<usize>>,
}

impl Arbitrary for Case {
    fn arbitrary(g: &mut Gen) -> Self {
        let run_count = 1 + usize::arbitrary(g) % 5;
        let runs: Vec<(String, bool)> = (0..run_count)
            .map(|_| {
                let len = 1 + usize::arbitrary(g) % 4;
                let text: String = (0..len)
                    .map(|_| *g.choose(&['a', 'b', 'c', 'd']).unwrap_or(&'a'))
                    .collect();
                (text, bool::arbitrary(g))
            })
            .collect();
        let total: usize = runs.iter().map(|(text, _)| text.len()).sum();
        let span_count = 1 + usize::arbitrary(g) % 2;
        let spans = (0..span_count)
            .map(|_| {
                let a = usize::arbitrary(g) % total;
                let b = a + 1 + usize::arbitrary(g) % (total - a);
                a..b
            })
            .collect();
        Case { runs, spans }
    }
}

impl Case {
    fn editor(&self) -> (Editor, RestrictedEditingExceptionCommand) {
        let children = self
            .runs
            .iter()
            .map(|(text, marked)| {
                let mut attrs = Attrs::new();
                if *marked {
                    attrs.insert(DEFAULT_ATTRIBUTE.to_string(), serde_json::Value::Bool(true));
                }
                Node::text_with_attrs(text.clone(), attrs)
            })
            .collect();
        let doc = Document {
            children: vec![Node::element("paragraph", children)],
        };
        let selection = Selection::from_ranges(
            self.spans
                .iter()
                .map(|span| {
                    Range::new(
                        Point::new(vec![0], span.start),
                        Point::new(vec![0], span.end),
                    )
                })
                .collect(),
        );
        let mut editor = Editor::new(doc, selection, registry(Default::default()).unwrap());
        let command = RestrictedEditingExceptionCommand::new(&mut editor);
        (editor, command)
    }
}

/// Text of the paragraph and, per byte, whether it carries the attribute.
fn flatten(doc: &Document) -> (String, Vec<bool>) {
    let mut text = String::new();
    let mut marks = Vec::new();
    let Some(Node::Element(paragraph)) = doc.children.first() else {
        return (text, marks);
    };
    for node in &paragraph.children {
        if let Node::Text(leaf) = node {
            text.push_str(&leaf.text);
            let marked = attr_is_set(&leaf.attrs, DEFAULT_ATTRIBUTE);
            marks.extend(std::iter::repeat_n(marked, leaf.text.len()));
        }
    }
    (text, marks)
}

fn force(editor: &mut Editor, command: &RestrictedEditingExceptionCommand, value: bool) {
    command.execute(editor, ExecuteOptions::force(value)).unwrap();
}

quickcheck::quickcheck! {
    fn forcing_true_is_idempotent(case: Case) -> bool {
        let (mut once, command) = case.editor();
        force(&mut once, &command, true);

        let (mut twice, command) = case.editor();
        force(&mut twice, &command, true);
        force(&mut twice, &command, true);

        once.doc() == twice.doc() && command.value(&twice)
    }

    fn forcing_true_then_false_equals_forcing_false(case: Case) -> bool {
        let (mut both, command) = case.editor();
        force(&mut both, &command, true);
        force(&mut both, &command, false);

        let (mut only_false, command) = case.editor();
        force(&mut only_false, &command, false);

        both.doc() == only_false.doc() && !command.value(&only_false)
    }

    fn toggle_touches_only_the_selection(case: Case) -> bool {
        let (mut editor, command) = case.editor();
        let (text_before, marks_before) = flatten(editor.doc());
        let target = !command.value(&editor);
        command.execute(&mut editor, ExecuteOptions::default()).unwrap();
        let (text_after, marks_after) = flatten(editor.doc());

        text_before == text_after
            && marks_after.iter().enumerate().all(|(ix, marked)| {
                if case.spans.iter().any(|span| span.contains(&ix)) {
                    *marked == target
                } else {
                    *marked == marks_before[ix]
                }
            })
    }

    fn leaves_stay_normalized(case: Case) -> bool {
        let (mut editor, command) = case.editor();
        command.execute(&mut editor, ExecuteOptions::default()).unwrap();

        let Some(Node::Element(paragraph)) = editor.doc().children.first() else {
            return false;
        };
        paragraph.children.windows(2).all(|pair| match pair {
            [Node::Text(left), Node::Text(right)] => left.attrs != right.attrs,
            _ => true,
        })
    }
}

#[test]
fn restores_original_when_selection_started_without_the_attribute() {
    let case = Case {
        runs: vec![("abc".to_string(), false), ("def".to_string(), true)],
        spans: vec![0..2],
    };
    let (mut editor, command) = case.editor();
    let before = editor.doc().clone();
    force(&mut editor, &command, true);
    assert_ne!(editor.doc(), &before);
    force(&mut editor, &command, false);
    assert_eq!(editor.doc(), &before);
}
