//! Transcoder command assembly
//!
//! The transcoder is configured as an argument template; the `[URL]` token
//! is replaced with the upstream URL after tokenisation, so a URL with
//! spaces still lands in a single argument. Optional user agent, proxy and
//! header arguments are prepended in that order.

use tokio::process::Command;

use crate::config::Settings;
use crate::provider::Provider;

/// Build the argument vector for one transcoder invocation
pub fn transcoder_args(settings: &Settings, provider: &Provider, url: &str) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(ua) = &settings.user_agent {
        args.push("-user_agent".to_string());
        args.push(ua.clone());
    }

    if let Some(proxy) = &provider.http_proxy {
        args.push("-http_proxy".to_string());
        args.push(format!("http://{}:{}", proxy.ip, proxy.port));
    }

    let mut headers = String::new();
    if let Some(referer) = &provider.referer {
        headers.push_str(&format!("Referer: {referer}\r\n"));
    }
    if let Some(origin) = &provider.origin {
        headers.push_str(&format!("Origin: {origin}\r\n"));
    }
    if !headers.is_empty() {
        args.push("-headers".to_string());
        args.push(headers);
    }

    for token in settings.transcoder_options.split_whitespace() {
        args.push(token.replace("[URL]", url));
    }

    args
}

/// Assemble the subprocess, stdio piped, ready to spawn
pub fn transcoder_command(settings: &Settings, provider: &Provider, url: &str) -> Command {
    let mut cmd = Command::new(&settings.transcoder_path);
    cmd.args(transcoder_args(settings, provider, url))
        .env("DISPLAY", ":0")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HttpProxy;

    fn provider() -> Provider {
        Provider::unknown("M1")
    }

    #[test]
    fn test_url_token_substitution() {
        let settings = Settings::default().transcoder_options("-hide_banner -i [URL] -c copy");

        let args = transcoder_args(&settings, &provider(), "http://src/a.ts");

        assert_eq!(
            args,
            vec!["-hide_banner", "-i", "http://src/a.ts", "-c", "copy"]
        );
    }

    #[test]
    fn test_url_with_spaces_stays_one_argument() {
        let settings = Settings::default().transcoder_options("-c [URL]");

        let args = transcoder_args(&settings, &provider(), "head -c 1000 /dev/zero");

        assert_eq!(args, vec!["-c", "head -c 1000 /dev/zero"]);
    }

    #[test]
    fn test_optional_arguments_precede_template() {
        let settings = Settings::default().user_agent("VLC/3.0");
        let mut provider = provider();
        provider.http_proxy = Some(HttpProxy {
            ip: "10.0.0.1".into(),
            port: "3128".into(),
        });
        provider.referer = Some("http://portal".into());
        provider.origin = Some("http://origin".into());

        let args = transcoder_args(&settings, &provider, "http://src/a.ts");

        assert_eq!(
            args,
            vec![
                "-user_agent",
                "VLC/3.0",
                "-http_proxy",
                "http://10.0.0.1:3128",
                "-headers",
                "Referer: http://portal\r\nOrigin: http://origin\r\n",
                "-i",
                "http://src/a.ts",
            ]
        );
    }

    #[test]
    fn test_no_header_block_without_headers() {
        let settings = Settings::default();

        let args = transcoder_args(&settings, &provider(), "u");

        assert!(!args.contains(&"-headers".to_string()));
        assert!(!args.contains(&"-user_agent".to_string()));
    }
}
