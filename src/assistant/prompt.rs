//! Instruction prompt handed to the agent on stdin.

use std::fmt::Write;
use std::path::Path;

use crate::assistant::plan::NO_REPLY;
use crate::assistant::workspace::names;
use crate::channels::email_types::MessageMeta;

/// Render the instructions for answering `message` from inside `work_dir`.
pub fn build_prompt(message: &MessageMeta, work_dir: &Path) -> String {
    let mut p = String::new();
    let dir = work_dir.display();

    p.push_str(
        "You are the company's email assistant. Using the message body and its \
         attachments, write a professional reply in the language of the sender.\n",
    );
    p.push_str("Requirements:\n");
    p.push_str("- Use a clear structure; give steps and conclusions where useful.\n");
    p.push_str(
        "- If you produce data files, charts or images, create them in the current \
         working directory and mention their file names.\n",
    );
    let _ = writeln!(
        p,
        "- Decide whether a reply is needed. If the message is unrelated to the assistant \
         or needs no answer, output \"{NO_REPLY}\" and nothing else."
    );
    let _ = writeln!(
        p,
        "- If a reply is needed, write the reply body to a file in the current working \
         directory, preferably {} (or {}).",
        names::REPLY_HTML,
        names::REPLY_MD
    );
    p.push_str("- Output format (strict): return a JSON object string with the fields:\n");
    p.push_str(
        "  { \"reply\": \"REPLY\", \"reply_file\": \"<absolute path>\", \"format\": \"html|md|txt\", \
         \"attachments\": [{\"path\":\"<absolute path>\",\"filename\":\"<optional>\",\"contentType\":\"<optional>\"}] }\n",
    );
    p.push_str(
        "- If you used files or emails as data or sources and a file is smaller than 10MB, \
         attach it to the reply so the sender can verify the source (list its absolute \
         path in attachments).\n",
    );
    p.push_str(
        "- To attach files, fill in the attachments array completely; path must be absolute. \
         Without attachments, omit the field or use an empty array.\n",
    );
    let _ = writeln!(
        p,
        "- If no reply is needed, output only the string {NO_REPLY} and nothing else."
    );

    let _ = writeln!(p, "Working directory: {dir}");
    p.push_str("Original message:\n");
    let _ = writeln!(p, "From: {}", message.from);
    let _ = writeln!(p, "Subject: {}", message.subject);
    let _ = writeln!(p, "Text:\n{}", message.text);
    if message.html_body().is_some() {
        let _ = writeln!(
            p,
            "(The message also has HTML content, saved as {})",
            names::EMAIL_HTML
        );
    }

    p.push_str("Attachments:\n");
    if message.attachments.is_empty() {
        p.push_str("none");
    } else {
        let list: Vec<String> = message
            .attachments
            .iter()
            .map(|a| format!("- {}", a.filename))
            .collect();
        p.push_str(&list.join("\n"));
    }
    p
}
