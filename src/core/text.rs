// 字幕文本整理

/// ASS 事件行里正文前的字段数（ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect）
const ASS_DIALOGUE_FIELDS: usize = 8;

/// 取出 ASS 事件行的正文部分；字段不足时原样返回
pub fn ass_dialogue_text(line: &str) -> &str {
    line.splitn(ASS_DIALOGUE_FIELDS + 1, ',')
        .nth(ASS_DIALOGUE_FIELDS)
        .unwrap_or(line)
}

/// 去掉 ASS 覆盖标签和 HTML 风格标签，处理转义换行，折叠空行
pub fn clean_subtitle_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_override = false;

    while let Some(ch) = chars.next() {
        if in_override {
            if ch == '}' {
                in_override = false;
            }
            continue;
        }
        match ch {
            '{' => in_override = true,
            '<' => {
                // 只把 <i> </b> <font color> 这类当标签吞掉
                let mut tag = String::from('<');
                let mut closed = false;
                while let Some(&next) = chars.peek() {
                    if next == '>' {
                        chars.next();
                        closed = true;
                        break;
                    }
                    if next.is_ascii_alphanumeric() || next.is_whitespace() || matches!(next, '/' | '=' | '"' | '#') {
                        tag.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !closed {
                    out.push_str(&tag);
                }
            }
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push('\\'),
            },
            '\r' => {}
            _ => out.push(ch),
        }
    }

    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
