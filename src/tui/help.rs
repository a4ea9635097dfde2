//! Keybind overlay, toggled with F1.

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
};

fn key(k: &str, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{k:<10}"), Style::default().fg(Color::Magenta)),
        Span::raw(what.to_string()),
    ])
}

pub(super) fn draw(f: &mut ratatui::Frame, area: Rect) {
    let popup = centered(area, 60, 23);
    f.render_widget(Clear, popup);

    let lines = vec![
        Line::from("Everywhere:"),
        key("F1", "Toggle this help"),
        key("Ctrl+C", "Quit"),
        Line::from(""),
        Line::from("Search:"),
        key("type", "Search as you type"),
        key("Up/Down", "Pick a result"),
        key("Enter", "Open the conversation, or contribute when nothing matched"),
        key("Esc", "Back to the start screen"),
        Line::from(""),
        Line::from("Contribute:"),
        key("Tab", "Next form field"),
        key("Enter", "Submit the handbook"),
        key("Esc", "Back to search (stops tracking an upload)"),
        Line::from(""),
        Line::from("Conversation:"),
        key("Enter", "Send your question"),
        key("Ctrl+S", "Save the transcript"),
        key("PgUp/PgDn", "Scroll the transcript"),
        key("Esc", "Pick a different institution"),
    ];
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, popup);
}

fn centered(area: Rect, percent_x: u16, min_height: u16) -> Rect {
    let height = min_height.min(area.height);
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(height),
            Constraint::Min(0),
        ])
        .split(area);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1]);
    horizontal[1]
}
