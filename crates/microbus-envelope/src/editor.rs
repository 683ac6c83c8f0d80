use microbus_message::{ChannelKeyboardEvent, EditorContent, EditorInitArgs, Rect};

/// Capability interface of the concrete editor hosted inside the envelope.
///
/// Handlers return `Err(description)` to fail an operation; the description
/// travels back to the channel as the response's error message, so it must
/// be self-contained text, never a live error object.
pub trait Editor: Send + 'static {
    /// Called once when the channel's init offer is accepted.
    fn init(&mut self, args: &EditorInitArgs) -> Result<(), String> {
        let _ = args;
        Ok(())
    }

    fn content(&self) -> Result<EditorContent, String>;

    fn set_content(&mut self, content: EditorContent) -> Result<(), String>;

    fn undo(&mut self);

    fn redo(&mut self);

    /// Render a preview of the current document (an SVG payload).
    fn preview(&self) -> Result<String, String>;

    /// Rectangle of the element matching `selector`, for guided-tour
    /// overlays.
    fn element_position(&self, selector: &str) -> Result<Rect, String>;

    fn apply_keyboard_event(&mut self, event: &ChannelKeyboardEvent) {
        let _ = event;
    }

    fn set_locale(&mut self, locale: &str) {
        let _ = locale;
    }
}

/// In-memory reference editor: plain text with undo/redo stacks.
#[derive(Debug, Default)]
pub struct TextEditor {
    content: EditorContent,
    undo_stack: Vec<EditorContent>,
    redo_stack: Vec<EditorContent>,
    locale: Option<String>,
    init_args: Option<EditorInitArgs>,
    keystrokes: u64,
}

impl TextEditor {
    pub fn new() -> Self {
        Self {
            content: EditorContent::new(""),
            ..Self::default()
        }
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn keystrokes(&self) -> u64 {
        self.keystrokes
    }
}

impl Editor for TextEditor {
    fn init(&mut self, args: &EditorInitArgs) -> Result<(), String> {
        self.init_args = Some(args.clone());
        Ok(())
    }

    fn content(&self) -> Result<EditorContent, String> {
        Ok(self.content.clone())
    }

    fn set_content(&mut self, content: EditorContent) -> Result<(), String> {
        self.undo_stack.push(std::mem::replace(&mut self.content, content));
        self.redo_stack.clear();
        Ok(())
    }

    fn undo(&mut self) {
        if let Some(previous) = self.undo_stack.pop() {
            self.redo_stack
                .push(std::mem::replace(&mut self.content, previous));
        }
    }

    fn redo(&mut self) {
        if let Some(next) = self.redo_stack.pop() {
            self.undo_stack
                .push(std::mem::replace(&mut self.content, next));
        }
    }

    fn preview(&self) -> Result<String, String> {
        let escaped = self
            .content
            .content
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        Ok(format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\"><text x=\"8\" y=\"16\">{escaped}</text></svg>"
        ))
    }

    fn element_position(&self, selector: &str) -> Result<Rect, String> {
        // A text editor has no real layout; id selectors get a deterministic
        // rectangle, anything else does not match.
        if let Some(id) = selector.strip_prefix('#') {
            Ok(Rect {
                x: 8.0,
                y: 8.0,
                width: (id.len() as f64) * 8.0,
                height: 24.0,
            })
        } else {
            Err(format!("no element matches selector '{selector}'"))
        }
    }

    fn apply_keyboard_event(&mut self, event: &ChannelKeyboardEvent) {
        if event.event_type == "keydown" {
            self.keystrokes += 1;
        }
    }

    fn set_locale(&mut self, locale: &str) {
        self.locale = Some(locale.to_string());
    }
}
