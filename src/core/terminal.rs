use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "                                      ",
        "  ___ __ _ _ __  / _| | _____      __ ",
        " / __/ _` | '_ \\| |_| |/ _ \\ \\ /\\ / / ",
        "| (_| (_| | |_) |  _| | (_) \\ V  V /  ",
        " \\___\\__,_| .__/|_| |_|\\___/ \\_/\\_/   ",
        "          |_|                         ",
    ];

    // #f59e0b → #f97316 → #ec4899, diagonal
    let stops: [(u8, u8, u8); 3] = [(245, 158, 11), (249, 115, 22), (236, 72, 153)];
    let max_w = 38u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;236;72;153mOne call, any model, durable results.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("capflow stopped.").bold().cyan());
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Link(String, String),
    Text(String),
    Hint(String, String),
    Blank,
}

/// Titled block of aligned help or status lines.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn link(mut self, label: &str, url: &str) -> Self {
        self.lines.push(GuideLine::Link(label.to_string(), url.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(GuideLine::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, example: &str, note: &str) -> Self {
        self.lines
            .push(GuideLine::Hint(example.to_string(), note.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    pub fn print(&self) {
        let width = self
            .lines
            .iter()
            .filter_map(|line| match line {
                GuideLine::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        println!("\n {}", style(&self.title).bold().underlined());
        for line in &self.lines {
            match line {
                GuideLine::Command(name, description) => println!(
                    "   {:<width$}  {}",
                    style(name).green(),
                    style(description).dim(),
                    width = width
                ),
                GuideLine::Status(label, value) => {
                    println!("   {} {}: {}", GEAR, style(label).bold().cyan(), value)
                }
                GuideLine::Link(label, url) => println!(
                    "   {} {}: {}",
                    GLOBE,
                    style(label).bold(),
                    style(url).underlined().cyan()
                ),
                GuideLine::Text(text) => println!("   {}", text),
                GuideLine::Hint(example, note) if note.is_empty() => {
                    println!("   $ {}", style(example).yellow())
                }
                GuideLine::Hint(example, note) => {
                    println!("   $ {}  {}", style(example).yellow(), style(note).dim())
                }
                GuideLine::Blank => println!(),
            }
        }
    }
}
