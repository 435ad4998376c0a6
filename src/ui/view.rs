//! Rendering for the TUI. Pure view code: reads `App`, never mutates it.

use super::{App, Tab, UiState};
use crate::domains::sessions::{Instance, Status};
use ratatui::Frame;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Clear, List, ListItem, Paragraph, Tabs, Wrap};

/// The inner dimensions of the preview pane for a given terminal size; used
/// to size the detached pty so captures render correctly.
pub(crate) fn preview_dims(width: u16, height: u16) -> (u16, u16) {
    let content_height = height.saturating_sub(2);
    let right_width = (width as u32 * 7 / 10) as u16;
    (
        right_width.saturating_sub(2).max(1),
        content_height.saturating_sub(3).max(1),
    )
}

pub(crate) fn draw(frame: &mut Frame, app: &App) {
    let [content, menu, error] = Layout::vertical([
        Constraint::Min(3),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .areas(frame.area());
    let [list_area, tabs_area] =
        Layout::horizontal([Constraint::Percentage(30), Constraint::Percentage(70)])
            .areas(content);

    draw_list(frame, app, list_area);
    draw_tabs(frame, app, tabs_area);
    draw_menu(frame, app, menu);
    draw_error(frame, app, error);

    if app.state == UiState::Prompt {
        draw_prompt_overlay(frame, app);
    }
}

fn status_span(instance: &Instance) -> Span<'static> {
    match instance.status() {
        Status::Running => Span::styled("● ", Style::default().fg(Color::Green)),
        Status::Ready => Span::styled("○ ", Style::default().fg(Color::Gray)),
        Status::Loading => Span::styled("… ", Style::default().fg(Color::Yellow)),
        Status::Paused => Span::styled("∥ ", Style::default().fg(Color::DarkGray)),
    }
}

fn draw_list(frame: &mut Frame, app: &App, area: Rect) {
    let editing_last = app.state == UiState::New;
    let items: Vec<ListItem> = app
        .instances
        .iter()
        .enumerate()
        .map(|(i, instance)| {
            let mut title = instance.title().to_string();
            if editing_last && i == app.instances.len() - 1 {
                title.push('▏');
            }
            let mut line = Line::from(vec![status_span(instance), Span::raw(title)]);
            if i == app.selected {
                line = line.style(Style::default().add_modifier(Modifier::REVERSED));
            }
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items).block(Block::bordered().title(" Instances "));
    frame.render_widget(list, area);
}

fn draw_tabs(frame: &mut Frame, app: &App, area: Rect) {
    let [tab_bar, body] =
        Layout::vertical([Constraint::Length(1), Constraint::Min(0)]).areas(area);

    let selected = match app.tab {
        Tab::Preview => 0,
        Tab::Diff => 1,
    };
    let tabs = Tabs::new(vec!["Preview", "Diff"])
        .select(selected)
        .highlight_style(Style::default().add_modifier(Modifier::BOLD));
    frame.render_widget(tabs, tab_bar);

    match app.tab {
        Tab::Preview => draw_preview(frame, app, body),
        Tab::Diff => draw_diff(frame, app, body),
    }
}

fn draw_preview(frame: &mut Frame, app: &App, area: Rect) {
    let text = strip_ansi(&app.preview_text);
    let paragraph = Paragraph::new(text)
        .block(Block::bordered())
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn draw_diff(frame: &mut Frame, app: &App, area: Rect) {
    let (title, body) = match app.selected_instance().and_then(|i| i.diff_stats()) {
        Some(stats) => {
            let lines: Vec<Line> = stats
                .content
                .lines()
                .map(|line| {
                    let style = if line.starts_with('+') {
                        Style::default().fg(Color::Green)
                    } else if line.starts_with('-') {
                        Style::default().fg(Color::Red)
                    } else {
                        Style::default()
                    };
                    Line::styled(line.to_string(), style)
                })
                .collect();
            (
                format!(" +{} -{} ", stats.added, stats.removed),
                Text::from(lines),
            )
        }
        None => (" no changes ".to_string(), Text::default()),
    };

    let paragraph = Paragraph::new(body)
        .block(Block::bordered().title(title))
        .scroll((app.diff_scroll, 0));
    frame.render_widget(paragraph, area);
}

fn draw_menu(frame: &mut Frame, app: &App, area: Rect) {
    let hints: &[(&str, &str, &str)] = match app.state {
        UiState::New => &[("enter", "submit title", "attach"), ("esc", "cancel", "")],
        UiState::Prompt => &[("enter", "send prompt", "attach"), ("esc", "cancel", "")],
        UiState::Default => &[
            ("n", "new", "new"),
            ("p", "new w/ prompt", "prompt"),
            ("enter", "attach", "attach"),
            ("P", "pause", "pause"),
            ("r", "resume", "resume"),
            ("s", "push", "submit"),
            ("D", "kill", "kill"),
            ("tab", "preview/diff", "tab"),
            ("q", "quit", "quit"),
        ],
    };

    let highlighted = app.keydown.map(|(name, _)| name);
    let mut spans: Vec<Span> = Vec::new();
    for (i, (key, desc, name)) in hints.iter().enumerate() {
        if i > 0 {
            spans.push(Span::styled(" • ", Style::default().fg(Color::DarkGray)));
        }
        let mut key_style = Style::default().fg(Color::Magenta);
        if highlighted == Some(*name) && !name.is_empty() {
            key_style = key_style.add_modifier(Modifier::BOLD | Modifier::UNDERLINED);
        }
        spans.push(Span::styled((*key).to_string(), key_style));
        spans.push(Span::styled(
            format!(" {desc}"),
            Style::default().fg(Color::Gray),
        ));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).centered(), area);
}

fn draw_error(frame: &mut Frame, app: &App, area: Rect) {
    if let Some((message, _)) = &app.error {
        let paragraph =
            Paragraph::new(message.as_str()).style(Style::default().fg(Color::Red));
        frame.render_widget(paragraph, area);
    }
}

fn draw_prompt_overlay(frame: &mut Frame, app: &App) {
    let area = centered_rect(frame.area(), 60, 20);
    frame.render_widget(Clear, area);
    let paragraph = Paragraph::new(format!("{}▏", app.input))
        .block(Block::bordered().title(" Enter prompt "))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn centered_rect(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let [_, middle, _] = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .areas(area);
    let [_, center, _] = Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .areas(middle);
    center
}

/// Drops ANSI escape sequences so captured pane content renders as plain
/// text in the preview pane. CSI and OSC sequences are skipped wholesale;
/// everything else passes through.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameter bytes until a final byte in 0x40..=0x7e.
            Some('[') => {
                for d in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&d) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC-backslash.
            Some(']') => {
                while let Some(d) = chars.next() {
                    if d == '\x07' {
                        break;
                    }
                    if d == '\x1b' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            // Charset designations carry one more byte.
            Some('(') | Some(')') => {
                chars.next();
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[1;32mhello\x1b[0m world"), "hello world");
    }

    #[test]
    fn strip_ansi_removes_osc_sequences() {
        assert_eq!(strip_ansi("\x1b]0;title\x07body"), "body");
        assert_eq!(strip_ansi("\x1b]10;rgb:f8/f8/f8\x1b\\body"), "body");
    }

    #[test]
    fn strip_ansi_passes_plain_text_through() {
        assert_eq!(strip_ansi("plain text\nwith lines"), "plain text\nwith lines");
    }

    #[test]
    fn preview_dims_shrink_with_the_terminal() {
        let (w, h) = preview_dims(100, 40);
        assert_eq!(w, 68);
        assert_eq!(h, 35);
        // Degenerate sizes never reach zero.
        let (w, h) = preview_dims(2, 2);
        assert_eq!((w, h), (1, 1));
    }
}
