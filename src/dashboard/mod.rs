//! Interactive GPU picker.
//!
//! Asks whether to pick a GPU at all, then either lists the compatible GPUs
//! or explains which groups failed isolation. The key handling lives in
//! `SelectionMenu` so it can be driven without a terminal.

use crate::errors::WizardResult;
use crate::gpu::isolation::{Classification, CompatibleGpu};
use crossterm::cursor::Show;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::{
    prelude::*,
    style::{Color, Modifier},
    text::{Line, Span},
    widgets::*,
};
use tracing::debug;

const TITLE: &str = "VFIO GPU Wizard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Confirm { yes: bool },
    Menu { selected: usize },
    Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// Operator did not want to pick a GPU.
    Declined,
    /// Nothing passes isolation; diagnostics were shown.
    NoCompatibleGpu,
    /// Operator backed out of the GPU menu.
    Cancelled,
    Selected(CompatibleGpu),
}

pub struct SelectionMenu<'a> {
    classification: &'a Classification,
    screen: Screen,
}

impl<'a> SelectionMenu<'a> {
    pub fn new(classification: &'a Classification) -> Self {
        Self { classification, screen: Screen::Confirm { yes: true } }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    /// Feed one key press; returns the outcome once the flow is finished.
    pub fn handle_key(&mut self, key: KeyCode) -> Option<SelectionOutcome> {
        match self.screen {
            Screen::Confirm { yes } => match key {
                KeyCode::Left | KeyCode::Right | KeyCode::Tab => {
                    self.screen = Screen::Confirm { yes: !yes };
                    None
                }
                KeyCode::Char('y') => self.advance(),
                KeyCode::Enter if yes => self.advance(),
                KeyCode::Enter | KeyCode::Char('n') | KeyCode::Esc => {
                    Some(SelectionOutcome::Declined)
                }
                _ => None,
            },
            Screen::Menu { selected } => {
                let last = self.classification.compatible.len().saturating_sub(1);
                match key {
                    KeyCode::Up => {
                        self.screen = Screen::Menu { selected: selected.saturating_sub(1) };
                        None
                    }
                    KeyCode::Down => {
                        self.screen = Screen::Menu { selected: (selected + 1).min(last) };
                        None
                    }
                    KeyCode::Enter => self
                        .classification
                        .compatible
                        .get(selected)
                        .cloned()
                        .map(SelectionOutcome::Selected),
                    KeyCode::Esc | KeyCode::Char('q') => Some(SelectionOutcome::Cancelled),
                    _ => None,
                }
            }
            Screen::Diagnostics => match key {
                KeyCode::Enter | KeyCode::Esc | KeyCode::Char('q') => {
                    Some(SelectionOutcome::NoCompatibleGpu)
                }
                _ => None,
            },
        }
    }

    fn advance(&mut self) -> Option<SelectionOutcome> {
        self.screen = if self.classification.has_compatible() {
            Screen::Menu { selected: 0 }
        } else {
            Screen::Diagnostics
        };
        None
    }
}

/// Text shown when no GPU passes isolation.
pub fn diagnostics_lines(classification: &Classification) -> Vec<String> {
    let mut lines = Vec::new();

    for (group_id, group) in &classification.bad_isolation {
        if group.devices.is_empty() {
            continue;
        }
        lines.push(format!("IOMMU Group '{}' has bad isolation:", group_id));
        lines.push(String::new());
        lines.extend(group.devices.iter().map(|device| format!("  {}", device)));
        lines.push(String::new());
    }

    for (group_id, error) in &classification.unreadable {
        lines.push(format!("IOMMU Group '{}' could not be read: {}", group_id, error));
        lines.push(String::new());
    }

    lines.push("No compatible GPU available.".to_string());
    lines
}

/// Puts the terminal back the way the shell expects it, on every exit path
/// once raw mode is on.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> WizardResult<Self> {
        enable_raw_mode()?;
        let guard = TerminalGuard;
        execute!(std::io::stdout(), EnterAlternateScreen)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            debug!(error = %e, "Failed to leave raw mode");
        }
        if let Err(e) = execute!(std::io::stdout(), LeaveAlternateScreen, Show) {
            debug!(error = %e, "Failed to restore terminal screen");
        }
    }
}

/// Run the picker on the real terminal.
pub fn run_selection(classification: &Classification) -> WizardResult<SelectionOutcome> {
    let _guard = TerminalGuard::enter()?;

    let backend = CrosstermBackend::new(std::io::stdout());
    let mut terminal = Terminal::new(backend)?;

    event_loop(&mut terminal, classification)
}

fn event_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    classification: &Classification,
) -> WizardResult<SelectionOutcome> {
    let mut menu = SelectionMenu::new(classification);

    loop {
        terminal.draw(|f| render(f, &menu))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if let Some(outcome) = menu.handle_key(key.code) {
                debug!(outcome = ?outcome, "Selection finished");
                return Ok(outcome);
            }
        }
    }
}

fn render(f: &mut Frame, menu: &SelectionMenu) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(1)])
        .split(f.size());

    let block = Block::default()
        .title(TITLE)
        .borders(Borders::ALL)
        .border_style(Style::new().fg(Color::LightBlue))
        .border_type(BorderType::Rounded);

    let help = match menu.screen {
        Screen::Confirm { yes } => {
            let (yes_style, no_style) = if yes {
                (highlight(), Style::new())
            } else {
                (Style::new(), highlight())
            };
            let body = vec![
                Line::from("Do you want to select a GPU?"),
                Line::from(""),
                Line::from(vec![
                    Span::styled("  < Yes >  ", yes_style),
                    Span::raw("   "),
                    Span::styled("  < No >  ", no_style),
                ]),
            ];
            f.render_widget(
                Paragraph::new(body).block(block).alignment(Alignment::Center),
                layout[0],
            );
            "←→: Toggle | Enter: Confirm | Esc: Quit"
        }
        Screen::Menu { selected } => {
            let items: Vec<ListItem> = menu
                .classification
                .compatible
                .iter()
                .map(|gpu| {
                    ListItem::new(Line::from(vec![
                        Span::raw(gpu.description.clone()),
                        Span::styled(format!("  [{}]", gpu.vfio), Style::new().fg(Color::DarkGray)),
                    ]))
                })
                .collect();

            let mut state = ListState::default();
            state.select(Some(selected));

            let list = List::new(items)
                .block(block.title("Select a GPU:"))
                .highlight_style(highlight())
                .highlight_symbol("▶ ");
            f.render_stateful_widget(list, layout[0], &mut state);
            "↑↓: Navigate | Enter: Select | Esc: Cancel"
        }
        Screen::Diagnostics => {
            let lines: Vec<Line> = diagnostics_lines(menu.classification)
                .into_iter()
                .map(Line::from)
                .collect();
            f.render_widget(
                Paragraph::new(lines).block(block).wrap(Wrap { trim: false }),
                layout[0],
            );
            "Enter: OK"
        }
    };

    f.render_widget(
        Paragraph::new(Span::styled(help, Style::new().fg(Color::LightYellow)))
            .alignment(Alignment::Center),
        layout[1],
    );
}

fn highlight() -> Style {
    Style::new()
        .fg(Color::Black)
        .bg(Color::LightBlue)
        .add_modifier(Modifier::BOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::isolation::BadIsolationGroup;
    use crate::gpu::pci::PciAddress;
    use ratatui::backend::TestBackend;

    fn gpu(slot: &str) -> CompatibleGpu {
        CompatibleGpu {
            description: format!("{} VGA compatible controller: NVIDIA", slot),
            slot: PciAddress::from(slot),
            devices: vec![PciAddress::from(slot)],
            vfio: "10de:2204".to_string(),
            iommu_group: 1,
        }
    }

    fn with_gpus() -> Classification {
        Classification {
            compatible: vec![gpu("0000:01:00.0"), gpu("0000:02:00.0")],
            ..Default::default()
        }
    }

    fn without_gpus() -> Classification {
        let mut classification = Classification::default();
        classification.bad_isolation.insert(
            5,
            BadIsolationGroup {
                group_id: 5,
                devices: vec![
                    "01:00.0 VGA compatible controller: NVIDIA".to_string(),
                    "01:00.2 USB controller: NVIDIA".to_string(),
                ],
            },
        );
        classification
    }

    #[test]
    fn test_terminal_guard_restores_without_a_tty() {
        // Restoring is best effort and must not panic when nothing was set up.
        drop(TerminalGuard);
    }

    #[test]
    fn test_declining_ends_flow() {
        let classification = with_gpus();

        let mut menu = SelectionMenu::new(&classification);
        assert_eq!(menu.handle_key(KeyCode::Char('n')), Some(SelectionOutcome::Declined));

        let mut menu = SelectionMenu::new(&classification);
        assert_eq!(menu.handle_key(KeyCode::Right), None);
        assert_eq!(menu.screen(), Screen::Confirm { yes: false });
        assert_eq!(menu.handle_key(KeyCode::Enter), Some(SelectionOutcome::Declined));
    }

    #[test]
    fn test_pick_second_gpu() {
        let classification = with_gpus();
        let mut menu = SelectionMenu::new(&classification);

        assert_eq!(menu.handle_key(KeyCode::Enter), None);
        assert_eq!(menu.screen(), Screen::Menu { selected: 0 });

        menu.handle_key(KeyCode::Down);
        menu.handle_key(KeyCode::Down);
        assert_eq!(menu.screen(), Screen::Menu { selected: 1 });

        assert_eq!(
            menu.handle_key(KeyCode::Enter),
            Some(SelectionOutcome::Selected(gpu("0000:02:00.0")))
        );
    }

    #[test]
    fn test_cancel_from_menu() {
        let classification = with_gpus();
        let mut menu = SelectionMenu::new(&classification);

        menu.handle_key(KeyCode::Char('y'));
        menu.handle_key(KeyCode::Up);
        assert_eq!(menu.screen(), Screen::Menu { selected: 0 });
        assert_eq!(menu.handle_key(KeyCode::Esc), Some(SelectionOutcome::Cancelled));
    }

    #[test]
    fn test_no_compatible_gpu_shows_diagnostics() {
        let classification = without_gpus();
        let mut menu = SelectionMenu::new(&classification);

        assert_eq!(menu.handle_key(KeyCode::Enter), None);
        assert_eq!(menu.screen(), Screen::Diagnostics);
        assert_eq!(menu.handle_key(KeyCode::Char('x')), None);
        assert_eq!(menu.handle_key(KeyCode::Enter), Some(SelectionOutcome::NoCompatibleGpu));
    }

    #[test]
    fn test_diagnostics_list_every_member() {
        let lines = diagnostics_lines(&without_gpus());
        assert_eq!(
            lines,
            vec![
                "IOMMU Group '5' has bad isolation:",
                "",
                "  01:00.0 VGA compatible controller: NVIDIA",
                "  01:00.2 USB controller: NVIDIA",
                "",
                "No compatible GPU available.",
            ]
        );
    }

    #[test]
    fn test_screens_render_on_test_backend() {
        let classification = with_gpus();
        let mut menu = SelectionMenu::new(&classification);
        let mut terminal = Terminal::new(TestBackend::new(80, 12)).unwrap();

        terminal.draw(|f| render(f, &menu)).unwrap();
        menu.handle_key(KeyCode::Enter);
        terminal.draw(|f| render(f, &menu)).unwrap();

        let buffer = terminal.backend().buffer().clone();
        let text: String = buffer.content.iter().map(|cell| cell.symbol()).collect();
        assert!(text.contains("Select a GPU:"));
        assert!(text.contains("0000:02:00.0"));
    }
}
