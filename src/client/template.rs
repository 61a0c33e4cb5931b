//! Workspace templates: what the main tab runs on open, and the banner drawn
//! when a tab connects.

/// Template id -> command that starts the template's dev server.
const START_COMMANDS: &[(&str, &str)] = &[
    (
        "react-app",
        "CHOKIDAR_USEPOLLING=true npm run dev -- --host 0.0.0.0 --port 5173",
    ),
    ("node-hello", "PORT=3000 npm start"),
    ("nextjs", "npm run dev"),
    (
        "angular",
        "ng serve --project my-app --host 0.0.0.0 --allowed-hosts=all --poll 2000",
    ),
    ("vue-app", "npm run dev -- --host 0.0.0.0"),
    ("python-core", "python main.py"),
    ("django", "python manage.py runserver 0.0.0.0:8000"),
    (
        "fastapi-app",
        "uvicorn main:app --host 0.0.0.0 --port 8000 --reload",
    ),
    ("go-api", "go run main.go"),
    ("html-site", "npx serve -y -p 3000 ."),
    ("cpp-hello", "g++ -o app main.cpp && ./app"),
    ("c-lang", "gcc -o app main.c && ./app"),
    ("rust-lang", "cargo run"),
    ("java-maven", "mvn spring-boot:run"),
    ("spring-boot", "mvn spring-boot:run"),
    ("ruby-lang", "ruby main.rb"),
    ("php-lang", "php -S 0.0.0.0:8000"),
    ("dotnet", "dotnet run"),
];

const FRAME: &str = "\x1b[38;5;33m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub public_port: u16,
}

impl TemplateInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, public_port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            public_port,
        }
    }

    pub fn start_command(&self) -> Option<&'static str> {
        start_command_for(&self.id)
    }

    /// Payload typed into the main tab once it opens: an access banner echoed
    /// by the shell, then the start command.
    pub fn startup_payload(&self) -> Option<String> {
        let command = self.start_command()?;
        let url = format!("http://127.0.0.1:{}", self.public_port);
        Some(format!(
            "echo -e \"\\n\\033[1;33m⚡ Initializing development environment...\\033[0m\\n\\n\
             \\033[1;32m   >>> Access your application at: \\033[4m{url}\\033[0m\\033[1;32m <<<\\033[0m\\n\" \
             && {command}\n"
        ))
    }
}

pub fn start_command_for(template_id: &str) -> Option<&'static str> {
    START_COMMANDS
        .iter()
        .find(|(id, _)| *id == template_id)
        .map(|(_, command)| *command)
}

/// One-time banner appended to a tab's history when its socket opens.
pub fn welcome_banner(template: &TemplateInfo, is_main: bool) -> String {
    let role = if is_main { "(Main)     " } else { "(Secondary)" };
    let blank = format!("{FRAME}│{}│{RESET}", " ".repeat(62));
    let lines = [
        format!("\r\n{FRAME}┌{}┐{RESET}", "─".repeat(62)),
        blank.clone(),
        format!(
            "{FRAME}│  \x1b[1;37mWelcome to Cloud IDE{RESET} {role}                          {FRAME}│{RESET}"
        ),
        format!(
            "{FRAME}│  \x1b[36mEnvironment{RESET}:    {:<36} {FRAME}│{RESET}",
            template.name
        ),
        format!(
            "{FRAME}│  \x1b[36mPort{RESET}:           {:<36} {FRAME}│{RESET}",
            template.public_port
        ),
        format!(
            "{FRAME}│  \x1b[36mStatus{RESET}:         \x1b[32m● Online{RESET}                                {FRAME}│{RESET}"
        ),
        blank,
        format!("{FRAME}└{}┘{RESET}", "─".repeat(62)),
        "\r\n".to_string(),
    ];
    lines.join("\r\n")
}
