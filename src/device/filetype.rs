//! MTP file type codes
//!
//! Mirrors libmtp's `LIBMTP_filetype_t`: the discriminants are the values the
//! native library uses, so codes coming off the wire map back with
//! [`Filetype::from_code`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;

/// File type of an object stored on an MTP device
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Filetype {
    Wav = 0,
    Mp3,
    Wma,
    Ogg,
    Audible,
    Mp4,
    UndefAudio,
    Wmv,
    Avi,
    Mpeg,
    Asf,
    Qt,
    UndefVideo,
    Jpeg,
    Jfif,
    Tiff,
    Bmp,
    Gif,
    Pict,
    Png,
    Vcalendar1,
    Vcalendar2,
    Vcard2,
    Vcard3,
    WindowsImageFormat,
    WinExec,
    Text,
    Html,
    Firmware,
    Aac,
    MediaCard,
    Flac,
    Mp2,
    M4a,
    Doc,
    Xml,
    Xls,
    Ppt,
    Mht,
    Jp2,
    Jpx,
    Album,
    Playlist,
    #[default]
    Unknown,
}

impl Filetype {
    /// Every file type, indexed by its libmtp code
    pub const ALL: [Filetype; 44] = [
        Filetype::Wav,
        Filetype::Mp3,
        Filetype::Wma,
        Filetype::Ogg,
        Filetype::Audible,
        Filetype::Mp4,
        Filetype::UndefAudio,
        Filetype::Wmv,
        Filetype::Avi,
        Filetype::Mpeg,
        Filetype::Asf,
        Filetype::Qt,
        Filetype::UndefVideo,
        Filetype::Jpeg,
        Filetype::Jfif,
        Filetype::Tiff,
        Filetype::Bmp,
        Filetype::Gif,
        Filetype::Pict,
        Filetype::Png,
        Filetype::Vcalendar1,
        Filetype::Vcalendar2,
        Filetype::Vcard2,
        Filetype::Vcard3,
        Filetype::WindowsImageFormat,
        Filetype::WinExec,
        Filetype::Text,
        Filetype::Html,
        Filetype::Firmware,
        Filetype::Aac,
        Filetype::MediaCard,
        Filetype::Flac,
        Filetype::Mp2,
        Filetype::M4a,
        Filetype::Doc,
        Filetype::Xml,
        Filetype::Xls,
        Filetype::Ppt,
        Filetype::Mht,
        Filetype::Jp2,
        Filetype::Jpx,
        Filetype::Album,
        Filetype::Playlist,
        Filetype::Unknown,
    ];

    /// The libmtp numeric code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a libmtp code back to a file type; out-of-range codes are `Unknown`
    pub fn from_code(code: u32) -> Self {
        Self::ALL
            .get(code as usize)
            .copied()
            .unwrap_or(Filetype::Unknown)
    }

    /// Human-readable description, as libmtp reports it
    pub fn description(self) -> &'static str {
        match self {
            Filetype::Wav => "RIFF WAVE file",
            Filetype::Mp3 => "ISO MPEG-1 Audio Layer 3",
            Filetype::Wma => "Microsoft Windows Media Audio",
            Filetype::Ogg => "Ogg container format",
            Filetype::Audible => "Audible.com Audio Codec",
            Filetype::Mp4 => "MPEG-4 Part 14 Container Format (Audio Emphasis)",
            Filetype::UndefAudio => "Unknown audio file",
            Filetype::Wmv => "Microsoft Windows Media Video",
            Filetype::Avi => "Audio Video Interleave",
            Filetype::Mpeg => "MPEG video stream",
            Filetype::Asf => "Microsoft Advanced Systems Format",
            Filetype::Qt => "Apple Quicktime container format",
            Filetype::UndefVideo => "Undefined video file",
            Filetype::Jpeg => "JPEG file",
            Filetype::Jfif => "JFIF file",
            Filetype::Tiff => "TIFF bitmap file",
            Filetype::Bmp => "BMP bitmap file",
            Filetype::Gif => "GIF bitmap file",
            Filetype::Pict => "PICT bitmap file",
            Filetype::Png => "Portable Network Graphics",
            Filetype::Vcalendar1 => "VCalendar version 1",
            Filetype::Vcalendar2 => "VCalendar version 2",
            Filetype::Vcard2 => "Version 2 VCard",
            Filetype::Vcard3 => "Version 3 VCard",
            Filetype::WindowsImageFormat => "Windows Image Format",
            Filetype::WinExec => "Windows executable",
            Filetype::Text => "Text file",
            Filetype::Html => "HTML file",
            Filetype::Firmware => "Firmware file",
            Filetype::Aac => "Advanced Audio Coding (AAC)/MPEG-2 Part 7/MPEG-4 Part 3",
            Filetype::MediaCard => "Media card",
            Filetype::Flac => "Free Lossless Audio Codec (FLAC)",
            Filetype::Mp2 => "ISO MPEG-1 Audio Layer 2",
            Filetype::M4a => "MPEG-4 Part 14 Container Format (Audio+Video Emphasis)",
            Filetype::Doc => "Microsoft Word Document",
            Filetype::Xml => "XML file",
            Filetype::Xls => "Microsoft Excel Spreadsheet",
            Filetype::Ppt => "Microsoft Powerpoint Presentation",
            Filetype::Mht => "MHT Compiled HTML Document",
            Filetype::Jp2 => "JPEG 2000",
            Filetype::Jpx => "JPEG 2000 eXtended",
            Filetype::Album => "Abstract Album file",
            Filetype::Playlist => "Abstract Playlist file",
            Filetype::Unknown => "Unknown filetype",
        }
    }

    /// Guess the file type from a file name's extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "wav" => Filetype::Wav,
            "mp3" => Filetype::Mp3,
            "wma" => Filetype::Wma,
            "ogg" | "oga" => Filetype::Ogg,
            "aa" | "aax" => Filetype::Audible,
            "mp4" => Filetype::Mp4,
            "wmv" => Filetype::Wmv,
            "avi" => Filetype::Avi,
            "mpg" | "mpeg" => Filetype::Mpeg,
            "asf" => Filetype::Asf,
            "mov" | "qt" => Filetype::Qt,
            "jpg" | "jpeg" => Filetype::Jpeg,
            "jfif" => Filetype::Jfif,
            "tif" | "tiff" => Filetype::Tiff,
            "bmp" => Filetype::Bmp,
            "gif" => Filetype::Gif,
            "pict" | "pct" => Filetype::Pict,
            "png" => Filetype::Png,
            "vcs" => Filetype::Vcalendar1,
            "ics" => Filetype::Vcalendar2,
            "vcf" => Filetype::Vcard3,
            "wif" => Filetype::WindowsImageFormat,
            "exe" | "com" | "dll" => Filetype::WinExec,
            "txt" => Filetype::Text,
            "htm" | "html" => Filetype::Html,
            "bin" => Filetype::Firmware,
            "aac" => Filetype::Aac,
            "flac" => Filetype::Flac,
            "mp2" => Filetype::Mp2,
            "m4a" => Filetype::M4a,
            "doc" => Filetype::Doc,
            "xml" => Filetype::Xml,
            "xls" => Filetype::Xls,
            "ppt" => Filetype::Ppt,
            "mht" => Filetype::Mht,
            "jp2" => Filetype::Jp2,
            "jpx" => Filetype::Jpx,
            "alb" => Filetype::Album,
            "pla" | "m3u" => Filetype::Playlist,
            _ => Filetype::Unknown,
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Filetype::Wav
                | Filetype::Mp3
                | Filetype::Wma
                | Filetype::Ogg
                | Filetype::Audible
                | Filetype::Mp4
                | Filetype::UndefAudio
                | Filetype::Aac
                | Filetype::Flac
                | Filetype::Mp2
                | Filetype::M4a
        )
    }

    pub fn is_video(self) -> bool {
        matches!(
            self,
            Filetype::Wmv
                | Filetype::Avi
                | Filetype::Mpeg
                | Filetype::Asf
                | Filetype::Qt
                | Filetype::UndefVideo
                | Filetype::Mp4
                | Filetype::M4a
        )
    }

    pub fn is_image(self) -> bool {
        matches!(
            self,
            Filetype::Jpeg
                | Filetype::Jfif
                | Filetype::Tiff
                | Filetype::Bmp
                | Filetype::Gif
                | Filetype::Pict
                | Filetype::Png
                | Filetype::WindowsImageFormat
                | Filetype::Jp2
                | Filetype::Jpx
        )
    }
}

impl Display for Filetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_table_position() {
        for (index, filetype) in Filetype::ALL.iter().enumerate() {
            assert_eq!(filetype.code() as usize, index, "{:?}", filetype);
            assert_eq!(Filetype::from_code(index as u32), *filetype);
        }
    }

    #[test]
    fn test_out_of_range_code_is_unknown() {
        assert_eq!(Filetype::from_code(44), Filetype::Unknown);
        assert_eq!(Filetype::from_code(u32::MAX), Filetype::Unknown);
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(Filetype::Mp3.description(), "ISO MPEG-1 Audio Layer 3");
        assert_eq!(Filetype::Unknown.description(), "Unknown filetype");
        assert_eq!(format!("{}", Filetype::Png), "Portable Network Graphics");
    }

    #[test]
    fn test_from_path() {
        let cases = vec![
            ("song.MP3", Filetype::Mp3),
            ("track.flac", Filetype::Flac),
            ("clip.mov", Filetype::Qt),
            ("photo.JPG", Filetype::Jpeg),
            ("notes.txt", Filetype::Text),
            ("firmware.bin", Filetype::Firmware),
            ("noextension", Filetype::Unknown),
            ("archive.zip", Filetype::Unknown),
        ];

        for (name, expected) in cases {
            assert_eq!(Filetype::from_path(name), expected, "Failed for: {}", name);
        }
    }

    #[test]
    fn test_categories() {
        assert!(Filetype::Mp3.is_audio());
        assert!(!Filetype::Mp3.is_video());
        assert!(Filetype::Avi.is_video());
        assert!(Filetype::Png.is_image());
        assert!(!Filetype::Text.is_image());
    }
}
