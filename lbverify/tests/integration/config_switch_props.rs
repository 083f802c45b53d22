//! strategy 書き換えのプロパティテスト

use lbverify::common::types::Strategy as LbStrategy;
use lbverify::config_switch::{rewrite_strategy, ConfigSwitcher};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct ConfigShape {
    initial: Option<&'static str>,
    indent: &'static str,
    comment: &'static str,
    crlf: bool,
    trailing_table: bool,
    final_newline: bool,
}

impl ConfigShape {
    fn render(&self) -> String {
        let mut lines = vec![
            "# gateway config".to_string(),
            "[server]".to_string(),
            "port = 8080".to_string(),
            String::new(),
            "[load_balancing]".to_string(),
        ];
        if let Some(value) = self.initial {
            lines.push(format!("{}strategy = \"{}\"{}", self.indent, value, self.comment));
        }
        lines.push("health_check = true".to_string());
        lines.push("# routing".to_string());
        if self.trailing_table {
            lines.push("[[routes]]".to_string());
            lines.push("name = \"default\"".to_string());
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut text = lines.join(eol);
        if self.final_newline {
            text.push_str(eol);
        }
        text
    }
}

fn config_shape() -> impl Strategy<Value = ConfigShape> {
    (
        prop::option::of(prop::sample::select(vec!["round_robin", "random", "first_available"])),
        prop::sample::select(vec!["", "  ", "\t"]),
        prop::sample::select(vec!["", "  # default", " #x"]),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(initial, indent, comment, crlf, trailing_table, final_newline)| ConfigShape {
                initial,
                indent,
                comment,
                crlf,
                trailing_table,
                final_newline,
            },
        )
}

fn lb_strategy() -> impl Strategy<Value = LbStrategy> {
    prop::sample::select(LbStrategy::ALL.to_vec())
}

fn without_strategy_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n')
        .filter(|line| !line.trim_start().starts_with("strategy"))
        .map(|line| line.trim_end_matches(['\r', '\n']))
        .collect()
}

proptest! {
    #[test]
    fn rewritten_file_parses_to_requested_strategy(shape in config_shape(), target in lb_strategy()) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom-config.toml");
        std::fs::write(&path, rewrite_strategy(&shape.render(), target.as_str())).unwrap();

        let current = ConfigSwitcher::new(&path).current_strategy().unwrap();
        prop_assert_eq!(current, Some(target));
    }

    #[test]
    fn later_rewrite_overrides_earlier_one(shape in config_shape(), first in lb_strategy(), second in lb_strategy()) {
        let text = shape.render();
        let twice = rewrite_strategy(&rewrite_strategy(&text, first.as_str()), second.as_str());
        prop_assert_eq!(twice, rewrite_strategy(&text, second.as_str()));
    }

    #[test]
    fn existing_assignment_keeps_every_other_line(shape in config_shape(), target in lb_strategy()) {
        prop_assume!(shape.initial.is_some());
        let text = shape.render();
        let rewritten = rewrite_strategy(&text, target.as_str());

        prop_assert_eq!(without_strategy_lines(&rewritten), without_strategy_lines(&text));
        prop_assert_eq!(rewritten.len() as isize - text.len() as isize,
            target.as_str().len() as isize - shape.initial.unwrap().len() as isize);
        if shape.crlf {
            prop_assert_eq!(rewritten.matches("\r\n").count(), text.matches("\r\n").count());
        }
    }

    #[test]
    fn restore_is_byte_identical_after_any_switches(
        shape in config_shape(),
        switches in prop::collection::vec(lb_strategy(), 1..6),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom-config.toml");
        let text = shape.render();
        std::fs::write(&path, &text).unwrap();

        let switcher = ConfigSwitcher::new(&path);
        let original = switcher.capture().unwrap();
        for strategy in &switches {
            switcher.set(*strategy).unwrap();
            prop_assert_eq!(switcher.current_strategy().unwrap(), Some(*strategy));
        }
        switcher.restore(&original).unwrap();

        prop_assert_eq!(std::fs::read(&path).unwrap(), text.into_bytes());
    }
}
